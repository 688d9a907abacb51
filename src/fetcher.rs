//! Metadata fetcher (C7): a one-shot TCP session that performs the
//! BitTorrent handshake (BEP-3), the extension handshake (BEP-10) and the
//! `ut_metadata` piece exchange (BEP-9) against a single candidate peer.
use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

use crate::bencode::{self, BencodeValue};
use crate::node_id::InfoHash;

const PIECE_LENGTH: usize = 16384;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const FRAME_TIMEOUT: Duration = Duration::from_secs(10);
const EXTENDED_MESSAGE_ID: u8 = 20;
const HANDSHAKE_SUB_ID: u8 = 0;
/// No real torrent's `info` dict approaches this; a peer claiming more is
/// lying, and allocating for the claim verbatim would let it crash the
/// whole process rather than just this session.
const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

/// Runs a single metadata fetch against `addr`, returning the raw bencoded
/// `info` dictionary bytes on success. Any failure along the way (timeout,
/// reset, hash mismatch, malformed peer message) is reported as `Err` and
/// must be swallowed by the caller: per spec.md §4.6 "any exception ends
/// the session silently".
#[instrument(skip(our_peer_id), fields(%info_hash, %addr))]
pub async fn fetch(info_hash: InfoHash, addr: SocketAddrV4, our_peer_id: [u8; 20]) -> Result<Vec<u8>> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("connect timed out")??;

    handshake(&mut stream, &info_hash, &our_peer_id).await?;
    run_extension_session(&mut stream, &info_hash).await
}

async fn handshake(stream: &mut TcpStream, info_hash: &InfoHash, our_peer_id: &[u8; 20]) -> Result<()> {
    let mut msg = Vec::with_capacity(68);
    msg.push(19u8);
    msg.extend_from_slice(b"BitTorrent protocol");
    let mut reserved = [0u8; 8];
    reserved[5] = 0x10; // advertise the extension protocol (bit 20)
    msg.extend_from_slice(&reserved);
    msg.extend_from_slice(info_hash.as_bytes());
    msg.extend_from_slice(our_peer_id);

    stream.write_all(&msg).await.context("writing handshake")?;

    let mut response = [0u8; 68];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut response))
        .await
        .context("handshake read timed out")?
        .context("reading handshake")?;

    if &response[28..48] != info_hash.as_bytes() {
        bail!("handshake info_hash mismatch");
    }
    Ok(())
}

async fn send_extended(stream: &mut TcpStream, sub_id: u8, body: &[u8]) -> Result<()> {
    let mut msg = Vec::with_capacity(2 + body.len());
    msg.push(EXTENDED_MESSAGE_ID);
    msg.push(sub_id);
    msg.extend_from_slice(body);
    let len = (msg.len() as u32).to_be_bytes();

    stream.write_all(&len).await?;
    stream.write_all(&msg).await?;
    Ok(())
}

async fn send_extension_handshake(stream: &mut TcpStream) -> Result<()> {
    let mut m = std::collections::HashMap::new();
    m.insert(b"ut_metadata".to_vec(), BencodeValue::Integer(1));
    let mut dict = std::collections::HashMap::new();
    dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
    let body = bencode::encode_to_vec(&BencodeValue::Dict(dict))?;
    send_extended(stream, HANDSHAKE_SUB_ID, &body).await
}

async fn request_piece(stream: &mut TcpStream, peer_ut_metadata_id: u8, piece: usize) -> Result<()> {
    let mut dict = std::collections::HashMap::new();
    dict.insert(b"msg_type".to_vec(), BencodeValue::Integer(0));
    dict.insert(b"piece".to_vec(), BencodeValue::Integer(piece as i64));
    let body = bencode::encode_to_vec(&BencodeValue::Dict(dict))?;
    send_extended(stream, peer_ut_metadata_id, &body).await
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    loop {
        let mut len_buf = [0u8; 4];
        timeout(FRAME_TIMEOUT, stream.read_exact(&mut len_buf))
            .await
            .context("frame read timed out")?
            .context("reading frame length")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue; // keep-alive
        }
        let mut payload = vec![0u8; len];
        timeout(FRAME_TIMEOUT, stream.read_exact(&mut payload))
            .await
            .context("frame read timed out")?
            .context("reading frame payload")?;
        return Ok(Some(payload));
    }
}

struct MetadataAssembly {
    pieces: Vec<Option<Vec<u8>>>,
    size: usize,
}

impl MetadataAssembly {
    fn new(size: usize) -> Self {
        let num_pieces = size.div_ceil(PIECE_LENGTH);
        Self { pieces: vec![None; num_pieces], size }
    }

    fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    fn concat(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size);
        for piece in &self.pieces {
            buf.extend_from_slice(piece.as_ref().expect("complete before concat"));
        }
        buf
    }
}

async fn run_extension_session(stream: &mut TcpStream, info_hash: &InfoHash) -> Result<Vec<u8>> {
    send_extension_handshake(stream).await?;

    let mut peer_ut_metadata_id: Option<u8> = None;
    let mut assembly: Option<MetadataAssembly> = None;

    loop {
        let Some(payload) = read_frame(stream).await? else {
            bail!("peer closed connection");
        };
        if payload.is_empty() || payload[0] != EXTENDED_MESSAGE_ID {
            continue; // not an extension message; ignore
        }
        if payload.len() < 2 {
            bail!("truncated extension message");
        }
        let sub_id = payload[1];
        let ext_payload = &payload[2..];

        if sub_id == HANDSHAKE_SUB_ID {
            let handshake = bencode::decode(ext_payload).context("decoding peer extension handshake")?;
            let m = handshake.get(b"m".as_ref()).and_then(BencodeValue::as_dict);
            let their_id = m
                .and_then(|m| m.get(b"ut_metadata".as_ref()))
                .and_then(BencodeValue::as_integer)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| anyhow!("peer does not support ut_metadata"))?;
            let metadata_size = handshake
                .get(b"metadata_size".as_ref())
                .and_then(BencodeValue::as_integer)
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| anyhow!("peer handshake missing metadata_size"))?;
            if metadata_size > MAX_METADATA_SIZE {
                bail!("peer claims implausible metadata_size {metadata_size}");
            }

            peer_ut_metadata_id = Some(their_id);
            let new_assembly = MetadataAssembly::new(metadata_size);
            for piece in 0..new_assembly.pieces.len() {
                request_piece(stream, their_id, piece).await?;
            }
            assembly = Some(new_assembly);
            continue;
        }

        if Some(sub_id) != peer_ut_metadata_id {
            continue; // not our negotiated ut_metadata id; ignore
        }

        let (header, consumed) =
            bencode::decode_prefix(ext_payload).context("decoding ut_metadata piece header")?;
        let piece_data = &ext_payload[consumed..];

        let msg_type = header
            .get(b"msg_type".as_ref())
            .and_then(BencodeValue::as_integer)
            .ok_or_else(|| anyhow!("piece message missing msg_type"))?;
        if msg_type == 2 {
            bail!("peer rejected metadata piece request");
        }
        if msg_type != 1 {
            continue;
        }

        let piece_index = header
            .get(b"piece".as_ref())
            .and_then(BencodeValue::as_integer)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| anyhow!("data message missing piece index"))?;

        let assembly = assembly.as_mut().ok_or_else(|| anyhow!("data before handshake"))?;
        let slot = assembly
            .pieces
            .get_mut(piece_index)
            .ok_or_else(|| anyhow!("piece index out of range"))?;
        *slot = Some(piece_data.to_vec());

        if assembly.is_complete() {
            let full = assembly.concat();
            let digest = Sha1::digest(&full);
            if digest.as_slice() != info_hash.as_bytes() {
                bail!("reassembled metadata hash mismatch");
            }
            return Ok(full);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_handshake(stream: &mut TcpStream) -> [u8; 68] {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn read_full_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    fn info_dict_bytes() -> Vec<u8> {
        b"d4:name9:test.ite".to_vec()
    }

    async fn serve_one_piece_metadata(listener: TcpListener, metadata: Vec<u8>, info_hash: InfoHash) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let their_handshake = read_handshake(&mut stream).await;
        assert_eq!(&their_handshake[28..48], info_hash.as_bytes());

        let mut our_handshake = vec![19u8];
        our_handshake.extend_from_slice(b"BitTorrent protocol");
        our_handshake.extend_from_slice(&[0u8; 8]);
        our_handshake.extend_from_slice(info_hash.as_bytes());
        our_handshake.extend_from_slice(&[0u8; 20]);
        stream.write_all(&our_handshake).await.unwrap();

        let _their_ext_handshake = read_full_frame(&mut stream).await;

        let mut m = std::collections::HashMap::new();
        m.insert(b"ut_metadata".to_vec(), BencodeValue::Integer(3));
        let mut dict = std::collections::HashMap::new();
        dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
        dict.insert(b"metadata_size".to_vec(), BencodeValue::Integer(metadata.len() as i64));
        let body = bencode::encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
        let mut ext_msg = vec![EXTENDED_MESSAGE_ID, HANDSHAKE_SUB_ID];
        ext_msg.extend_from_slice(&body);
        stream.write_all(&(ext_msg.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(&ext_msg).await.unwrap();

        let _piece_request = read_full_frame(&mut stream).await;

        let mut header = std::collections::HashMap::new();
        header.insert(b"msg_type".to_vec(), BencodeValue::Integer(1));
        header.insert(b"piece".to_vec(), BencodeValue::Integer(0));
        let header_bytes = bencode::encode_to_vec(&BencodeValue::Dict(header)).unwrap();
        let mut data_msg = vec![EXTENDED_MESSAGE_ID, 3u8];
        data_msg.extend_from_slice(&header_bytes);
        data_msg.extend_from_slice(&metadata);
        stream.write_all(&(data_msg.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(&data_msg).await.unwrap();
    }

    #[tokio::test]
    async fn fetches_and_verifies_single_piece_metadata() {
        let metadata = info_dict_bytes();
        let info_hash = InfoHash(Sha1::digest(&metadata).into());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let server = tokio::spawn(serve_one_piece_metadata(listener, metadata.clone(), info_hash));
        let result = fetch(info_hash, addr, [0u8; 20]).await.unwrap();
        server.await.unwrap();

        assert_eq!(result, metadata);
    }

    async fn serve_oversized_handshake(listener: TcpListener, info_hash: InfoHash, claimed_metadata_size: i64) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let their_handshake = read_handshake(&mut stream).await;
        assert_eq!(&their_handshake[28..48], info_hash.as_bytes());

        let mut our_handshake = vec![19u8];
        our_handshake.extend_from_slice(b"BitTorrent protocol");
        our_handshake.extend_from_slice(&[0u8; 8]);
        our_handshake.extend_from_slice(info_hash.as_bytes());
        our_handshake.extend_from_slice(&[0u8; 20]);
        stream.write_all(&our_handshake).await.unwrap();

        let _their_ext_handshake = read_full_frame(&mut stream).await;

        let mut m = std::collections::HashMap::new();
        m.insert(b"ut_metadata".to_vec(), BencodeValue::Integer(3));
        let mut dict = std::collections::HashMap::new();
        dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
        dict.insert(b"metadata_size".to_vec(), BencodeValue::Integer(claimed_metadata_size));
        let body = bencode::encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
        let mut ext_msg = vec![EXTENDED_MESSAGE_ID, HANDSHAKE_SUB_ID];
        ext_msg.extend_from_slice(&body);
        stream.write_all(&(ext_msg.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(&ext_msg).await.unwrap();
        // No piece request should ever arrive; the session must bail before
        // allocating an assembly for the claimed size.
    }

    #[tokio::test]
    async fn oversized_metadata_size_is_rejected_without_allocating() {
        let info_hash = InfoHash([7u8; 20]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let server = tokio::spawn(serve_oversized_handshake(listener, info_hash, 10_000_000_000));
        let result = fetch(info_hash, addr, [0u8; 20]).await;
        server.await.unwrap();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn hash_mismatch_is_rejected() {
        let metadata = info_dict_bytes();
        let wrong_hash = InfoHash([0xAAu8; 20]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        // The server reads/validates info_hash against what the client
        // actually sent; exercise the mismatch on reassembly instead by
        // having the server claim a hash that doesn't match its own data.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let their_handshake = read_handshake(&mut stream).await;
            let client_info_hash = InfoHash::from_slice(&their_handshake[28..48]).unwrap();

            let mut our_handshake = vec![19u8];
            our_handshake.extend_from_slice(b"BitTorrent protocol");
            our_handshake.extend_from_slice(&[0u8; 8]);
            our_handshake.extend_from_slice(client_info_hash.as_bytes());
            our_handshake.extend_from_slice(&[0u8; 20]);
            stream.write_all(&our_handshake).await.unwrap();

            let _their_ext_handshake = read_full_frame(&mut stream).await;

            let mut m = std::collections::HashMap::new();
            m.insert(b"ut_metadata".to_vec(), BencodeValue::Integer(3));
            let mut dict = std::collections::HashMap::new();
            dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
            dict.insert(b"metadata_size".to_vec(), BencodeValue::Integer(metadata.len() as i64));
            let body = bencode::encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
            let mut ext_msg = vec![EXTENDED_MESSAGE_ID, HANDSHAKE_SUB_ID];
            ext_msg.extend_from_slice(&body);
            stream.write_all(&(ext_msg.len() as u32).to_be_bytes()).await.unwrap();
            stream.write_all(&ext_msg).await.unwrap();

            let _piece_request = read_full_frame(&mut stream).await;

            let mut header = std::collections::HashMap::new();
            header.insert(b"msg_type".to_vec(), BencodeValue::Integer(1));
            header.insert(b"piece".to_vec(), BencodeValue::Integer(0));
            let header_bytes = bencode::encode_to_vec(&BencodeValue::Dict(header)).unwrap();
            let mut data_msg = vec![EXTENDED_MESSAGE_ID, 3u8];
            data_msg.extend_from_slice(&header_bytes);
            data_msg.extend_from_slice(&metadata);
            stream.write_all(&(data_msg.len() as u32).to_be_bytes()).await.unwrap();
            stream.write_all(&data_msg).await.unwrap();
        });

        let result = fetch(wrong_hash, addr, [0u8; 20]).await;
        server.await.unwrap();
        assert!(result.is_err());
    }
}
