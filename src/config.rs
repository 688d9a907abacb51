//! Immutable configuration recognized by the supervisor, per the data model
//! in spec.md §3.
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// The three well-known Mainline DHT routers.
pub fn default_bootstrap() -> Vec<(String, u16)> {
    vec![
        ("router.bittorrent.com".to_string(), 6881),
        ("dht.transmissionbt.com".to_string(), 6881),
        ("router.utorrent.com".to_string(), 6881),
    ]
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: Ipv4Addr,
    pub listen_port: u16,
    pub bootstrap: Vec<(String, u16)>,
    pub filter_capacity: usize,
    pub filter_error_rate: f64,
    pub filter_path: PathBuf,
    pub storage_dir: PathBuf,
    pub fetch_concurrency: usize,
    pub find_interval: Duration,
    pub status_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: Ipv4Addr::new(0, 0, 0, 0),
            listen_port: 6881,
            bootstrap: default_bootstrap(),
            filter_capacity: 100_000_000,
            filter_error_rate: 1e-4,
            filter_path: PathBuf::from("seen_info_hashes.bloom"),
            storage_dir: PathBuf::from("bt"),
            fetch_concurrency: 100,
            find_interval: Duration::from_secs(60),
            status_interval: Duration::from_secs(30),
        }
    }
}
