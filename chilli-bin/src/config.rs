use anyhow::{bail, Context, Result};
use chilli_core::Config;
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, value_parser, default_value = "/etc/chilli/chilli.toml")]
    pub config_file: PathBuf,

    /// Log at debug level regardless of `loglevel`.
    #[clap(short, long)]
    pub debug: bool,
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let config_contents = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = toml::from_str(&config_contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;

    if config.max_clients == 0 {
        bail!("max_clients must be at least 1");
    }
    if config.msg_queue_depth == 0 {
        bail!("msg_queue_depth must be at least 1");
    }
    if config.uamurl.is_empty() {
        bail!("uamurl must be set");
    }
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
