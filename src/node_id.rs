//! 160-bit node and torrent identifiers, and the compact wire encodings
//! the DHT uses for node and peer contact lists.
use rand::RngCore;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// A 20-byte Kademlia node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

/// A 20-byte torrent identifier: the SHA-1 of a bencoded `info` dictionary.
/// Structurally identical to `NodeId` but kept as a distinct type since the
/// two play disjoint roles on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

macro_rules! impl_id20 {
    ($ty:ident) => {
        impl $ty {
            pub fn as_bytes(&self) -> &[u8; 20] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; 20]>::try_from(bytes).ok().map(Self)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl AsRef<[u8]> for $ty {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

impl_id20!(NodeId);
impl_id20!(InfoHash);

/// Generates a fresh random 20-byte identifier from a CSPRNG.
pub fn generate() -> NodeId {
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    NodeId(bytes)
}

/// Generates a random `InfoHash`-shaped 20-byte value, used by the discovery
/// loop to pick a fresh `find_node` target each round.
pub fn random_target() -> NodeId {
    generate()
}

/// Builds the id this node claims to be when replying to `target`: the
/// first 19 bytes of `target` with our own last byte appended. This makes
/// every responder look like a near neighbor of whoever it talks to,
/// maximizing the traffic sent our way, without requiring us to maintain an
/// honest routing table (the edge-sybil policy). With no `target`, returns
/// our real id.
pub fn fake_id_near(target: Option<&NodeId>, own: &NodeId) -> NodeId {
    match target {
        Some(target) => {
            let mut id = target.0;
            id[19] = own.0[19];
            NodeId(id)
        }
        None => *own,
    }
}

/// A `(NodeId, IPv4, port)` triple, the DHT's 26-byte compact node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

/// Decodes a `nodes` field into compact node records. Records are fixed at
/// 26 bytes; a trailing remainder shorter than that is silently dropped.
pub fn decode_compact_nodes(buf: &[u8]) -> Vec<CompactNode> {
    buf.chunks_exact(26)
        .filter_map(|record| {
            let id = NodeId::from_slice(&record[0..20])?;
            let ip = Ipv4Addr::new(record[20], record[21], record[22], record[23]);
            let port = u16::from_be_bytes([record[24], record[25]]);
            Some(CompactNode {
                id,
                addr: SocketAddrV4::new(ip, port),
            })
        })
        .collect()
}

/// Decodes a `values` field (a list of 6-byte compact peer strings) into
/// contact addresses, dropping any entry that isn't exactly 6 bytes.
pub fn decode_compact_peers<'a>(values: impl IntoIterator<Item = &'a [u8]>) -> Vec<SocketAddrV4> {
    values
        .into_iter()
        .filter_map(|peer| {
            if peer.len() != 6 {
                return None;
            }
            let ip = Ipv4Addr::new(peer[0], peer[1], peer[2], peer[3]);
            let port = u16::from_be_bytes([peer[4], peer[5]]);
            Some(SocketAddrV4::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_id_near_preserves_target_prefix_and_own_suffix() {
        let target = NodeId([b'S'; 20]);
        let own = generate();
        let fake = fake_id_near(Some(&target), &own);
        assert_eq!(&fake.0[0..19], &target.0[0..19]);
        assert_eq!(fake.0[19], own.0[19]);
    }

    #[test]
    fn fake_id_near_returns_own_id_without_target() {
        let own = generate();
        assert_eq!(fake_id_near(None, &own), own);
    }

    #[test]
    fn decodes_compact_nodes_and_drops_trailing_partial_record() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[1u8; 20]);
        buf.extend_from_slice(&[127, 0, 0, 1]);
        buf.extend_from_slice(&6881u16.to_be_bytes());
        buf.extend_from_slice(&[0u8; 10]); // trailing partial record

        let nodes = decode_compact_nodes(&buf);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].addr, SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881));
    }

    #[test]
    fn decodes_compact_peers_and_drops_invalid_entries() {
        let good = [127u8, 0, 0, 1, 0x1A, 0xE1]; // 127.0.0.1:6881
        let bad = [0u8, 1, 2]; // wrong length
        let peers = decode_compact_peers([&good[..], &bad[..]]);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0], SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881));
    }
}
