//! Command line interface.

use std::path::PathBuf;

use clap::Parser;

use crate::config::DEFAULT_CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(name = "vigil", about = "eBPF file integrity monitor", version)]
pub struct Options {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Log level: debug, info, warn, error or off.
    #[arg(short, long)]
    pub level: Option<String>,

    /// Path to the state database.
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Path to the compiled eBPF object.
    #[arg(long)]
    pub bpf_object: Option<PathBuf>,
}

pub fn parse_from_args() -> Options {
    Options::parse()
}
