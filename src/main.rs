use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;

use ll_box::container::Container;
use ll_box::logger::{self, LogConfig};
use ll_box::oci::Runtime;

/// Sandbox engine for Linglong applications. The caller hands over a fully
/// resolved runtime document; the engine builds the container it describes
/// and exits with the payload's code.
#[derive(Parser, Debug)]
#[command(name = "ll-box", version)]
struct Opts {
    /// Runtime document: a file path, or the number of an inherited file
    /// descriptor to read the document from
    config: String,
    /// Container identifier for the state record; defaults to the
    /// document's hostname
    id: Option<String>,
}

fn main() {
    let opts = Opts::parse();

    if let Err(e) = logger::init(LogConfig::from_env()) {
        eprintln!("log init failed: {:?}", e);
    }

    match run(opts) {
        Ok(code) => exit(code),
        Err(e) => {
            log::error!("ll-box failed: {:?}", e);
            exit(-1);
        }
    }
}

fn run(opts: Opts) -> Result<i32> {
    let (runtime, bundle) = load_runtime(&opts.config)?;

    let id = match opts.id {
        Some(id) => id,
        None => runtime.hostname.clone(),
    };

    let container = Container::new(bundle, id, runtime)?;
    container.start()
}

/// Loads the document from `argv[1]`: a positive numeric value is an
/// inherited file descriptor, anything else a file path. The bundle
/// directory (for relative paths in the document) is the config file's
/// directory, or the working directory for fd input.
fn load_runtime(config: &str) -> Result<(Runtime, PathBuf)> {
    if let Ok(fd) = config.parse::<i32>() {
        if fd > 0 {
            let runtime = Runtime::from_fd(fd)?;
            let bundle = env::current_dir().context("failed to get the working directory")?;
            return Ok((runtime, bundle));
        }
    }

    let path = PathBuf::from(config);
    let runtime = Runtime::load(&path)?;
    let canonical = fs::canonicalize(&path)
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    let bundle = canonical
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    Ok((runtime, bundle))
}
