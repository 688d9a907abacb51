//! Bencode decoding.
//!
//! Parses directly off a byte slice with an explicit cursor rather than a
//! `Read` stream, so callers that need to know exactly how many bytes a
//! value consumed (the BEP-9 metadata piece framing, see `fetcher`) can get
//! that for free instead of re-scanning for a terminator.
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::HashMap;
use tracing::instrument;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.buf.get(self.pos).copied().ok_or(BencodeError::UnexpectedEOI)
    }

    fn advance(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BencodeError::UnexpectedEOI)?;
        let slice = self.buf.get(self.pos..end).ok_or(BencodeError::UnexpectedEOI)?;
        self.pos = end;
        Ok(slice)
    }

    fn next(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a str> {
        let start = self.pos;
        loop {
            let b = self.peek()?;
            if b == delimiter {
                let slice = &self.buf[start..self.pos];
                self.pos += 1;
                return std::str::from_utf8(slice)
                    .map_err(|e| BencodeError::InvalidFormat(format!("non-UTF8 length/integer: {e}")));
            }
            self.pos += 1;
        }
    }
}

/// Decodes a complete bencoded byte string `<length>:<data>`.
#[instrument(skip(cur), level = "trace")]
fn decode_string<'a>(cur: &mut Cursor<'a>) -> BencodeResult<Vec<u8>> {
    let length_str = cur.read_until(b':')?;
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    Ok(cur.advance(length)?.to_vec())
}

/// Decodes a bencoded integer `i<number>e`, rejecting leading zeros and `-0`.
#[instrument(skip(cur), level = "trace")]
fn decode_integer(cur: &mut Cursor<'_>) -> BencodeResult<i64> {
    if cur.next()? != b'i' {
        return Err(BencodeError::InvalidFormat("integer must start with 'i'".into()));
    }
    let num_str = cur.read_until(b'e')?;

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str != "0" && num_str.trim_start_matches('-').starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }

    num_str.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)
}

/// Decodes a bencoded list `l<items>e`.
#[instrument(skip(cur), level = "trace")]
fn decode_list(cur: &mut Cursor<'_>) -> BencodeResult<Vec<BencodeValue>> {
    if cur.next()? != b'l' {
        return Err(BencodeError::InvalidFormat("list must start with 'l'".into()));
    }
    let mut list = Vec::new();
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        list.push(decode_next(cur)?);
    }
    Ok(list)
}

/// Decodes a bencoded dictionary `d<pairs>e`. Keys must be byte strings.
#[instrument(skip(cur), level = "trace")]
fn decode_dict(cur: &mut Cursor<'_>) -> BencodeResult<HashMap<Vec<u8>, BencodeValue>> {
    if cur.next()? != b'd' {
        return Err(BencodeError::InvalidFormat("dict must start with 'd'".into()));
    }
    let mut dict = HashMap::new();
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        let key = decode_string(cur)?;
        let value = decode_next(cur)?;
        dict.insert(key, value);
    }
    Ok(dict)
}

#[instrument(skip(cur), level = "trace")]
fn decode_next(cur: &mut Cursor<'_>) -> BencodeResult<BencodeValue> {
    match cur.peek()? {
        b'0'..=b'9' => decode_string(cur).map(BencodeValue::String),
        b'i' => decode_integer(cur).map(BencodeValue::Integer),
        b'l' => decode_list(cur).map(BencodeValue::List),
        b'd' => decode_dict(cur).map(BencodeValue::Dict),
        other => Err(BencodeError::InvalidFormat(format!(
            "unexpected character: {}",
            other as char
        ))),
    }
}

/// Decodes `data` as a single bencoded value. Errors if any trailing bytes remain.
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Decodes the bencoded value prefixing `data` and returns it along with the
/// number of bytes it occupied, leaving the remainder unparsed. Used to find
/// the exact boundary between a bencoded header and trailing raw bytes (the
/// `ut_metadata` piece payload).
pub fn decode_prefix(data: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut cur = Cursor::new(data);
    let value = decode_next(&mut cur)?;
    Ok((value, cur.pos))
}
