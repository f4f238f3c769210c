/*!
 * ferrokv Server Entry Point
 *
 * Initializes logging, reads the configuration, binds the listener and runs
 * the worker event loops until the process is stopped.
 */

use anyhow::Result;
use clap::Parser;
use ferrokv::{Config, Server};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=debug
    env_logger::init();

    let config = Config::parse();
    log::debug!("config: {:?}", config);

    // Blocks until every worker exits
    Server::bind(config)?.run()
}
