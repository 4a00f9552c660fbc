use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pyrite::client::Client;
use pyrite::config::{ClientConfig, ServerConfig};
use pyrite::router::Request;
use pyrite::server::Server;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    mode: Mode,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Runs an echo server
    Server {
        #[clap(default_value = "127.0.0.1:8888")]
        address: String,

        /// idle time in seconds after which sessions are evicted
        #[clap(long, default_value_t = 120)]
        max_life_time: u64,
    },
    /// Connects to an echo server and sends each message as a promise
    Client {
        server_address: String,

        messages: Vec<String>,

        /// timeout in milliseconds
        #[clap(long, default_value_t = 1000)]
        timeout: u64,
    },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match args.mode {
        Mode::Server { address, max_life_time } => run_server(address.parse()?, max_life_time).await,
        Mode::Client { server_address, messages, timeout } => run_client(server_address.parse()?, messages, timeout).await,
    }
}

async fn run_server(address: SocketAddr, max_life_time: u64) -> anyhow::Result<()> {
    let mut config = ServerConfig::new(address);
    config.max_life_time = Duration::from_secs(max_life_time);

    let server = Server::bind(config).await?;
    server.add_route_fn("echo", |request: Request| async move {
        info!("echoing {:?} from {:?}", request.message.body, request.remote);
        Some(request.message.reply(request.message.body.clone()))
    }).await?;

    info!("echo server listening on {:?} - press Ctrl-C to stop", server.local_addr()?);
    tokio::signal::ctrl_c().await?;

    server.shutdown().await;
    Ok(())
}

async fn run_client(server_address: SocketAddr, messages: Vec<String>, timeout: u64) -> anyhow::Result<()> {
    let mut config = ClientConfig::new(server_address);
    config.protocol.timeout = Duration::from_millis(timeout);

    let client = Client::connect(config).await?;
    info!("connected to {:?}, session {:?}, max life time {:?}",
        server_address, client.session_token().await, client.max_life_time().await);

    for message in messages {
        match client.promise("echo", message.as_str()).await {
            Ok(reply) => println!("{} (rtt {:?})", reply, client.last_rtt().await),
            Err(e) => warn!("no reply to {:?}: {}", message, e),
        }
    }

    client.shutdown().await;
    Ok(())
}
