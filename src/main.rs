use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dht_crawl::config::Config;
use dht_crawl::supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

/// A passive Mainline DHT crawler: harvests info_hash values from
/// announce_peer/get_peers traffic and fetches their metadata.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// UDP address to bind the DHT socket to.
    #[arg(long, default_value = "0.0.0.0")]
    listen_host: Ipv4Addr,

    /// UDP port to bind the DHT socket to.
    #[arg(long, default_value_t = 6881)]
    listen_port: u16,

    /// Directory under which retrieved .torrent files are written.
    #[arg(long, default_value = "bt")]
    storage_dir: PathBuf,

    /// Path to the persistent seen-set snapshot.
    #[arg(long, default_value = "seen_info_hashes.bloom")]
    filter_path: PathBuf,

    /// Expected number of distinct info_hash values the filter is sized for.
    #[arg(long, default_value_t = 100_000_000)]
    filter_capacity: usize,

    /// Target false-positive rate of the seen-set.
    #[arg(long, default_value_t = 1e-4)]
    filter_error_rate: f64,

    /// Maximum number of concurrent metadata fetch sessions.
    #[arg(long, default_value_t = 100)]
    fetch_concurrency: usize,

    /// Seconds between discovery find_node rounds.
    #[arg(long, default_value_t = 60)]
    find_interval: u64,

    /// Seconds between status log lines.
    #[arg(long, default_value_t = 30)]
    status_interval: u64,

    /// Bootstrap host:port pair; may be repeated. Defaults to the three
    /// well-known Mainline routers when omitted.
    #[arg(long = "bootstrap", value_parser = parse_bootstrap)]
    bootstrap: Vec<(String, u16)>,
}

fn parse_bootstrap(s: &str) -> Result<(String, u16), String> {
    let (host, port) = s.rsplit_once(':').ok_or_else(|| format!("expected host:port, got {s:?}"))?;
    let port: u16 = port.parse().map_err(|_| format!("invalid port in {s:?}"))?;
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config {
        listen_host: cli.listen_host,
        listen_port: cli.listen_port,
        bootstrap: if cli.bootstrap.is_empty() { dht_crawl::config::default_bootstrap() } else { cli.bootstrap },
        filter_capacity: cli.filter_capacity,
        filter_error_rate: cli.filter_error_rate,
        filter_path: cli.filter_path,
        storage_dir: cli.storage_dir,
        fetch_concurrency: cli.fetch_concurrency,
        find_interval: Duration::from_secs(cli.find_interval),
        status_interval: Duration::from_secs(cli.status_interval),
    };

    match Supervisor::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}
