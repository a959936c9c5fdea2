// src/main.rs
use anyhow::Result;
use clap::Parser;

use warp_pool::cli::{self, Cli};
use warp_pool::logging;

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.log_json {
        logging::init_with(true);
    } else {
        logging::init();
    }
    cli::run(cli)
}
