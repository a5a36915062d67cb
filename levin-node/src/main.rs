use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::net::TcpStream;

use levin::{ConnectionTable, HandlerConfig, TcpTransport};

use crate::dispatcher::{EchoDispatcher, COMMAND_PING};

mod dispatcher;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Remote peer to dial, e.g. 127.0.0.1:48080
    #[arg(short, long)]
    remote: SocketAddr,
}

fn init_logging() {
    SimpleLogger::new().with_colors(true).with_level(LevelFilter::Debug).with_local_timestamps().init().unwrap();
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logging();
    let args = Args::parse();

    let invoke_timeout = Duration::from_secs(5);
    let config = HandlerConfig { handshake_command: Some(COMMAND_PING), invoke_timeout, ..HandlerConfig::default() };
    let table = ConnectionTable::with_config(config);
    table.set_handler(Arc::new(EchoDispatcher));

    let stream = TcpStream::connect(args.remote).await?;
    let transport = Arc::new(TcpTransport::new(stream));
    let connection_id = match table.spawn_connection(false, transport) {
        Ok(id) => id,
        Err(err) => {
            log::warn!("could not register connection to {}: {}", args.remote, err);
            return Ok(());
        }
    };

    match table.invoke(connection_id, COMMAND_PING, b"ping".to_vec(), Duration::ZERO).await {
        Ok(payload) => {
            log::info!("peer {} answered with {} bytes: {:?}", args.remote, payload.len(), String::from_utf8_lossy(&payload));
        }
        Err(err) => {
            log::warn!("invoke to {} failed: {}", args.remote, err);
        }
    }

    if let Err(err) = table.close(connection_id).await {
        log::warn!("error while closing connection to {}: {}", args.remote, err);
    }

    Ok(())
}
