//! Integration with `clap`

use std::path::PathBuf;

use clap::Parser;

/// Command line arguments
#[derive(Parser)]
#[clap(about, version)]
pub struct Args {
    /// Path to the TOML config file. Overrides `MEOWLNIR_CONFIG`.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Validate the config file, then exit without binding the HTTP
    /// listener or contacting the homeserver.
    #[clap(long)]
    pub check_config: bool,
}

/// Parse command line arguments into structured data
pub fn parse() -> Args {
    Args::parse()
}
