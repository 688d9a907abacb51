//! Library root for the DHT crawler.
//!
//! Re-exports the component modules used by the binary: the bencode codec,
//! node-id utilities, the persistent filter and torrent store, the KRPC
//! codec and DHT engine, the metadata fetcher, and the supervisor that
//! wires them together.
pub mod bencode;
pub mod config;
pub mod dht;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod krpc;
pub mod node_id;
pub mod store;
pub mod supervisor;
