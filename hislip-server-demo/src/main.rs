//! # HiSLIP Demo Server
//!
//! Serves simulated instruments over HiSLIP, so that clients can be tested
//! without hardware.
//!
//! ## Overview
//!
//! Every sub-address given with `--subaddress` is backed by its own
//! [`instrument::Instrument`]. Without any, the sub-addresses `hislip0`,
//! `hislip1` and `hislip2` are served. The server stops on Ctrl-C.
pub mod instrument;

use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use clap_num::maybe_hex;
use env_logger::Env;
use hislip_protocol::DEFAULT_PORT;
use hislip_server::server::{Builder, Config};
use tokio::net::TcpListener;

use crate::instrument::Instrument;

const DEFAULT_SUBADDRESSES: [&str; 3] = ["hislip0", "hislip1", "hislip2"];

#[derive(Parser)]
#[command(about = "HiSLIP server serving simulated instruments", long_about=None)]
struct Args {
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    #[arg(long, help = "Maximum number of open connections")]
    connections_max: Option<usize>,

    #[arg(long, help = "Number of runtime worker threads")]
    worker_threads_max: Option<usize>,

    #[arg(long, help = "Maximum number of blocking threads of the runtime")]
    worker_queue_depth_max: Option<usize>,

    #[arg(long, value_parser=maybe_hex::<u64>, help = "Largest accepted payload in bytes, decimal or hex")]
    payload_size_max: Option<u64>,

    #[arg(long, help = "Read timeout of a single message in milliseconds")]
    message_timeout_ms: Option<u64>,

    #[arg(long, help = "Run sessions in overlapped mode")]
    overlap: bool,

    #[arg(short, long, help = "Sub-address to serve, may be repeated")]
    subaddress: Vec<String>,
}

impl Args {
    fn builder(&self) -> Builder {
        let defaults = Config::default();
        let mut builder = Builder::new()
            .port(self.port)
            .connections_max(self.connections_max.unwrap_or(defaults.connections_max))
            .worker_threads_max(
                self.worker_threads_max
                    .unwrap_or(defaults.worker_threads_max),
            )
            .worker_queue_depth_max(
                self.worker_queue_depth_max
                    .unwrap_or(defaults.worker_queue_depth_max),
            )
            .payload_size_max(self.payload_size_max.unwrap_or(defaults.payload_size_max))
            .overlap_mode(self.overlap);
        if let Some(ms) = self.message_timeout_ms {
            builder = builder.message_timeout(Duration::from_millis(ms));
        }
        builder
    }

    fn subaddresses(&self) -> Vec<String> {
        if self.subaddress.is_empty() {
            DEFAULT_SUBADDRESSES.map(String::from).to_vec()
        } else {
            self.subaddress.clone()
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting HiSLIP server");

    let args = Args::parse();
    log::debug!("Parsed arguments: ip={}, port={}", args.ip, args.port);

    let mut server = args.builder().build();
    let config = server.config().clone();
    log::debug!(
        "Server config: connections_max={}, max_sessions={}, payload_size_max={:#x}, overlap_mode={}",
        config.connections_max,
        config.max_sessions,
        config.payload_size_max,
        config.overlap_mode
    );
    for name in args.subaddresses() {
        let instrument = Instrument::new(&name);
        log::info!("Serving {} as {}", instrument.identity(), name);
        server.register_subaddress(name, instrument)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads_max.max(1))
        .max_blocking_threads(config.worker_queue_depth_max.max(1))
        .enable_all()
        .build()?;

    let addr = SocketAddr::new(args.ip, config.port);
    log::info!("Binding to address: {}", addr);
    runtime.block_on(async {
        let listener = TcpListener::bind(addr).await?;
        server
            .serve_until(listener, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Cannot wait for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await
    })?;
    log::info!("Server stopped");
    Ok(())
}
