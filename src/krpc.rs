//! KRPC codec & dispatcher (C5): frames and routes the bencoded
//! query/response/error messages the Mainline DHT exchanges over UDP.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::bencode::{self, BencodeValue};
use crate::node_id::{self, CompactNode, InfoHash, NodeId};

/// Cap on outstanding `get_peers` transactions. Response latency bounds the
/// live set in practice; this is a backstop against unbounded growth if
/// responses never arrive.
const MAX_TRANSACTIONS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        sender_id: NodeId,
    },
    FindNode {
        sender_id: NodeId,
        target: NodeId,
    },
    GetPeers {
        sender_id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        sender_id: NodeId,
        info_hash: InfoHash,
        port: Option<u16>,
        implied_port: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    FindNode { nodes: Vec<CompactNode> },
    GetPeers { info_hash: InfoHash, peers: Vec<SocketAddrV4> },
}

/// An inbound message after shape-based routing per spec.md §4.4. Anything
/// that doesn't fit a recognized shape (unknown query, bare error, a
/// `get_peers` response whose transaction already expired) is `Unroutable`
/// and is logged and dropped by the caller.
pub enum Inbound {
    Query { transaction_id: Vec<u8>, query: Query },
    Response(Response),
    Unroutable,
}

/// Outstanding `get_peers` transactions, keyed by transaction id, bounded
/// at `MAX_TRANSACTIONS` with FIFO eviction of the oldest entry.
pub struct TransactionTable {
    counter: AtomicU64,
    get_peers: HashMap<Vec<u8>, InfoHash>,
    order: VecDeque<Vec<u8>>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            get_peers: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// A monotonically increasing counter rendered as decimal ASCII.
    /// Uniqueness is only required among outstanding transactions; wrap
    /// around is acceptable since response latency bounds the live set.
    fn next_transaction_id(&self) -> Vec<u8> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        n.to_string().into_bytes()
    }

    fn register_get_peers(&mut self, transaction_id: Vec<u8>, info_hash: InfoHash) {
        if self.get_peers.len() >= MAX_TRANSACTIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.get_peers.remove(&oldest);
            }
        }
        self.order.push_back(transaction_id.clone());
        self.get_peers.insert(transaction_id, info_hash);
    }

    fn take_get_peers(&mut self, transaction_id: &[u8]) -> Option<InfoHash> {
        let info_hash = self.get_peers.remove(transaction_id)?;
        self.order.retain(|id| id != transaction_id);
        Some(info_hash)
    }
}

fn dict_bytes<'a>(dict: &'a HashMap<Vec<u8>, BencodeValue>, key: &[u8]) -> Option<&'a [u8]> {
    dict.get(key).and_then(BencodeValue::as_bytes)
}

fn dict_int(dict: &HashMap<Vec<u8>, BencodeValue>, key: &[u8]) -> Option<i64> {
    dict.get(key).and_then(BencodeValue::as_integer)
}

fn str_dict(args: &BencodeValue) -> Option<&HashMap<Vec<u8>, BencodeValue>> {
    args.as_dict()
}

/// Builds a `ping` query. Returns the bencoded bytes.
pub fn ping(table: &TransactionTable, own_id: &NodeId) -> Vec<u8> {
    build_query(table, b"ping", vec![(b"id".to_vec(), BencodeValue::String(own_id.as_bytes().to_vec()))])
}

/// Builds a `find_node` query for `target`.
pub fn find_node(table: &TransactionTable, own_id: &NodeId, target: &NodeId) -> Vec<u8> {
    build_query(
        table,
        b"find_node",
        vec![
            (b"id".to_vec(), BencodeValue::String(own_id.as_bytes().to_vec())),
            (b"target".to_vec(), BencodeValue::String(target.as_bytes().to_vec())),
        ],
    )
}

/// Builds a `get_peers` query and registers the transaction so a later
/// response carrying `values` (but no `info_hash` of its own) can be
/// correlated back to it.
pub fn get_peers(table: &mut TransactionTable, own_id: &NodeId, info_hash: &InfoHash) -> Vec<u8> {
    let transaction_id = table.next_transaction_id();
    table.register_get_peers(transaction_id.clone(), *info_hash);
    encode_query(
        transaction_id,
        b"get_peers",
        vec![
            (b"id".to_vec(), BencodeValue::String(own_id.as_bytes().to_vec())),
            (b"info_hash".to_vec(), BencodeValue::String(info_hash.as_bytes().to_vec())),
        ],
    )
}

fn build_query(table: &TransactionTable, method: &[u8], args: Vec<(Vec<u8>, BencodeValue)>) -> Vec<u8> {
    encode_query(table.next_transaction_id(), method, args)
}

fn encode_query(transaction_id: Vec<u8>, method: &[u8], args: Vec<(Vec<u8>, BencodeValue)>) -> Vec<u8> {
    let mut msg = HashMap::new();
    msg.insert(b"t".to_vec(), BencodeValue::String(transaction_id));
    msg.insert(b"y".to_vec(), BencodeValue::String(b"q".to_vec()));
    msg.insert(b"q".to_vec(), BencodeValue::String(method.to_vec()));
    msg.insert(b"a".to_vec(), BencodeValue::Dict(args.into_iter().collect()));
    bencode::encode_to_vec(&BencodeValue::Dict(msg)).expect("KRPC messages always encode")
}

fn encode_response(transaction_id: &[u8], fields: Vec<(Vec<u8>, BencodeValue)>) -> Vec<u8> {
    let mut msg = HashMap::new();
    msg.insert(b"t".to_vec(), BencodeValue::String(transaction_id.to_vec()));
    msg.insert(b"y".to_vec(), BencodeValue::String(b"r".to_vec()));
    msg.insert(b"r".to_vec(), BencodeValue::Dict(fields.into_iter().collect()));
    bencode::encode_to_vec(&BencodeValue::Dict(msg)).expect("KRPC messages always encode")
}

pub fn ping_r(transaction_id: &[u8], id: &NodeId) -> Vec<u8> {
    encode_response(transaction_id, vec![(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()))])
}

pub fn find_node_r(transaction_id: &[u8], id: &NodeId) -> Vec<u8> {
    encode_response(
        transaction_id,
        vec![
            (b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec())),
            (b"nodes".to_vec(), BencodeValue::String(Vec::new())),
        ],
    )
}

/// `token` need not be cryptographically bound: this crawler does not
/// issue meaningful tokens and never validates them on inbound
/// `announce_peer` (its participation is passive harvest, not an
/// authoritative DHT node). The first two bytes of `info_hash` suffice.
pub fn get_peers_r(transaction_id: &[u8], id: &NodeId, info_hash: &InfoHash) -> Vec<u8> {
    let token = info_hash.as_bytes()[0..2].to_vec();
    encode_response(
        transaction_id,
        vec![
            (b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec())),
            (b"token".to_vec(), BencodeValue::String(token)),
            (b"nodes".to_vec(), BencodeValue::String(Vec::new())),
        ],
    )
}

/// Decodes and routes a raw inbound datagram. Decode failures and messages
/// that aren't a dictionary or lack `y` are swallowed, never aborting the
/// caller, per spec.md §4.4.
pub fn dispatch(table: &mut TransactionTable, data: &[u8]) -> Inbound {
    let Ok(value) = bencode::decode(data) else {
        return Inbound::Unroutable;
    };
    let Some(dict) = value.as_dict() else {
        return Inbound::Unroutable;
    };
    let Some(y) = dict_bytes(dict, b"y") else {
        return Inbound::Unroutable;
    };

    match y {
        b"q" => dispatch_query(dict),
        b"r" => dispatch_response(table, dict),
        b"e" => {
            debug!("ignoring KRPC error message");
            Inbound::Unroutable
        }
        other => {
            debug!(query = ?String::from_utf8_lossy(other), "ignoring unknown KRPC message type");
            Inbound::Unroutable
        }
    }
}

fn dispatch_query(dict: &HashMap<Vec<u8>, BencodeValue>) -> Inbound {
    let Some(transaction_id) = dict_bytes(dict, b"t") else {
        return Inbound::Unroutable;
    };
    let Some(method) = dict_bytes(dict, b"q") else {
        return Inbound::Unroutable;
    };
    let Some(args) = dict.get(b"a".as_ref()).and_then(str_dict) else {
        return Inbound::Unroutable;
    };
    let Some(sender_id) = dict_bytes(args, b"id").and_then(NodeId::from_slice) else {
        return Inbound::Unroutable;
    };

    let query = match method {
        b"ping" => Query::Ping { sender_id },
        b"find_node" => {
            let Some(target) = dict_bytes(args, b"target").and_then(NodeId::from_slice) else {
                return Inbound::Unroutable;
            };
            Query::FindNode { sender_id, target }
        }
        b"get_peers" => {
            let Some(info_hash) = dict_bytes(args, b"info_hash").and_then(InfoHash::from_slice) else {
                return Inbound::Unroutable;
            };
            Query::GetPeers { sender_id, info_hash }
        }
        b"announce_peer" => {
            let Some(info_hash) = dict_bytes(args, b"info_hash").and_then(InfoHash::from_slice) else {
                return Inbound::Unroutable;
            };
            let port = dict_int(args, b"port").and_then(|p| u16::try_from(p).ok());
            let implied_port = dict_int(args, b"implied_port").unwrap_or(0) != 0;
            Query::AnnouncePeer { sender_id, info_hash, port, implied_port }
        }
        other => {
            debug!(query = ?String::from_utf8_lossy(other), "ignoring unknown query method");
            return Inbound::Unroutable;
        }
    };

    Inbound::Query { transaction_id: transaction_id.to_vec(), query }
}

fn dispatch_response(table: &mut TransactionTable, dict: &HashMap<Vec<u8>, BencodeValue>) -> Inbound {
    let Some(r) = dict.get(b"r".as_ref()).and_then(str_dict) else {
        return Inbound::Unroutable;
    };

    if let Some(nodes_bytes) = dict_bytes(r, b"nodes") {
        let nodes = node_id::decode_compact_nodes(nodes_bytes);
        return Inbound::Response(Response::FindNode { nodes });
    }

    if let Some(values) = r.get(b"values".as_ref()).and_then(BencodeValue::as_list) {
        // The info_hash is unrecoverable from the response itself; only a
        // still-registered transaction can supply it. Per the Open
        // Question in spec.md §9, an unmatched `values` response is
        // dropped rather than guessed at.
        let Some(transaction_id) = dict_bytes(dict, b"t") else {
            return Inbound::Unroutable;
        };
        let Some(info_hash) = table.take_get_peers(transaction_id) else {
            return Inbound::Unroutable;
        };
        let peer_strings = values.iter().filter_map(BencodeValue::as_bytes);
        let peers = node_id::decode_compact_peers(peer_strings);
        return Inbound::Response(Response::GetPeers { info_hash, peers });
    }

    Inbound::Unroutable
}
