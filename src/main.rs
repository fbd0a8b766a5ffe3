use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use sigscope::{
    SourceConfig,
    SourceType,
    discovery::Discovery,
    multicast::McConfig,
    server::{
        AnalyzerServer,
        ServerConfig,
        UserDb,
    },
};

/// Serve a local signal source to remote analyzer clients.
#[derive(Debug, Parser)]
#[command(name = "sigscope-devserv")]
struct Args {
    /// Address to listen on
    #[clap(short, long, default_value = "0.0.0.0:28001")]
    address: SocketAddr,

    /// User database (JSON)
    #[clap(short, long)]
    users: PathBuf,

    /// Source type: file, soapysdr, stdin, tonegen
    #[clap(short = 't', long, default_value = "tonegen")]
    source: String,

    /// Capture file for file sources
    #[clap(short, long)]
    path: Option<PathBuf>,

    /// Center frequency in Hz
    #[clap(short, long, default_value = "100000000")]
    frequency: f64,

    /// Sample rate in Hz
    #[clap(short = 'r', long, default_value = "1000000")]
    samplerate: f64,

    /// Interface IP to fan the PSD stream out on
    #[clap(short, long)]
    multicast_if: Option<std::net::Ipv4Addr>,

    /// Session idle timeout in seconds
    #[clap(long, default_value = "120")]
    idle_timeout: u64,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let Some(ty) = SourceType::from_name(&args.source) else {
        tracing::error!(source = %args.source, "unknown source type");
        return std::process::ExitCode::FAILURE;
    };

    let mut profile = SourceConfig::new(ty);
    profile.freq = args.frequency;
    profile.samp_rate = args.samplerate;
    profile.path = args.path;

    let users = match UserDb::load(&args.users) {
        Ok(users) => users,
        Err(error) => {
            tracing::error!(%error, "cannot load user database");
            return std::process::ExitCode::FAILURE;
        }
    };
    if users.is_empty() {
        tracing::error!("user database is empty; nobody could ever connect");
        return std::process::ExitCode::FAILURE;
    }

    let mut config = ServerConfig::new(args.address, profile);
    config.idle_timeout = Duration::from_secs(args.idle_timeout);
    if let Some(interface) = args.multicast_if {
        config.multicast = Some(McConfig {
            interfaces: vec![interface],
            ..Default::default()
        });
    }

    // the discovery listener only runs when the environment asks for it
    let _discovery = match Discovery::from_env() {
        Some(Ok(discovery)) => Some(discovery),
        Some(Err(error)) => {
            tracing::error!(%error, "cannot start discovery listener");
            return std::process::ExitCode::FAILURE;
        }
        None => None,
    };

    let server = match AnalyzerServer::bind(config, users).await {
        Ok(server) => server,
        Err(error) => {
            tracing::error!(%error, "cannot bind server");
            return std::process::ExitCode::FAILURE;
        }
    };

    tracing::info!(address = %args.address, "serving");
    match server.serve().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "server failed");
            std::process::ExitCode::FAILURE
        }
    }
}
