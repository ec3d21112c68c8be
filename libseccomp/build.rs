const MINIMUM_VERSION: &str = "2.4";
const PKG_NAME: &str = "libseccomp";

fn main() {
    match pkg_config::Config::new()
        .atleast_version(MINIMUM_VERSION)
        .probe(PKG_NAME)
    {
        Ok(_) => {}
        Err(err) => {
            eprintln!(
                "{:?} could not be found meeting minimum version requirement {:?}: {}",
                PKG_NAME, MINIMUM_VERSION, err
            );
            std::process::exit(1);
        }
    }
}
