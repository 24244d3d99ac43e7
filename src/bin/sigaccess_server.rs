use std::{error::Error, net::SocketAddr};

use clap::Parser;
use log::info;
use sigaccess::{DataServer, data::CLIENT_PROTOCOL_VERSION, protocol::demo_signal};

/// Serves synthetic signals (ramp, sine, irregular, status_bad, put) for trying out clients.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:56565")]
    address: SocketAddr,
    /// Highest protocol version to accept
    #[arg(long = "protocol", default_value_t = CLIENT_PROTOCOL_VERSION)]
    protocol: u32,
    /// Refuse clients offering an older protocol version
    #[arg(long = "min-protocol", default_value_t = 0)]
    min_protocol: u32,
    /// Connections served at once
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = DataServer::bind(cli.address, demo_signal)?
        .with_version(cli.protocol)
        .with_min_client_version(cli.min_protocol)
        .with_workers(cli.workers);

    let handle = server.shutdown_handle()?;
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        handle.shutdown();
    })?;

    server.listen()?;
    Ok(())
}
