//! Response recognition on a streaming byte buffer.
//!
//! An interpreter never assumes the buffer holds a whole message. It works
//! in two steps:
//! - `find_response` locates the earliest registered token in the buffer
//! - `parse_response` checks that the response starting there is
//!   structurally complete and extracts its payload
//!
//! Token order inside a [`TokenTable`] matters: when two tokens start at the
//! same offset the one registered first wins, so a token that is a prefix of
//! another must be registered after it. Parsing never consumes anything on
//! [`ParseOutcome::Incomplete`]; the caller keeps the bytes and retries once
//! more data has arrived.
//!
//! ## Dialects
//!
//! - `s2c`: EvoLogics S2C AT command set
//! - `applicon`: Applicon SEA JSON messages plus `RECV` lines
//! - `csa`: `PACKET,<len>,<payload>,EPCK` framing
//! - `moda`: MODA signaling channel (`DRIVER::RX_STARTED::<n>;`)
//! - `ahoi`: DLE STX framed binary packets

pub mod ahoi;
pub mod applicon;
pub mod csa;
pub mod moda;
pub mod s2c;

use std::fmt::Debug;
use std::str::FromStr;

/// Line terminator used by the AT style dialects.
pub const CRLF: &[u8] = b"\r\n";

/// First offset of `needle` in `haystack`.
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// An ordered, read-only table of response tokens.
#[derive(Debug)]
pub struct TokenTable<K: 'static> {
    entries: Vec<(&'static str, K)>,
}

/// A token located in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found<K> {
    pub kind: K,
    /// Offset of the first token byte.
    pub start: usize,
    pub token_len: usize,
}

impl<K> Found<K> {
    /// Offset of the first byte after the token.
    pub fn body(&self) -> usize {
        self.start + self.token_len
    }
}

impl<K: Copy> TokenTable<K> {
    pub fn new(entries: &[(&'static str, K)]) -> Self {
        Self {
            entries: entries.to_vec(),
        }
    }

    /// Earliest token in `buf`; equal offsets go to the earlier table entry.
    pub fn find(&self, buf: &[u8]) -> Option<Found<K>> {
        let mut best: Option<Found<K>> = None;
        for (token, kind) in &self.entries {
            // Only a strictly earlier match can displace the current best.
            let limit = best.map_or(buf.len(), |b| (b.start + token.len()).min(buf.len()));
            if let Some(start) = find_bytes(&buf[..limit], token.as_bytes()) {
                if best.is_none_or(|b| start < b.start) {
                    best = Some(Found {
                        kind: *kind,
                        start,
                        token_len: token.len(),
                    });
                }
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tokens(&self) -> impl Iterator<Item = (&'static str, K)> + '_ {
        self.entries.iter().copied()
    }
}

/// Metadata carried by a data reception report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RxInfo {
    pub length: usize,
    pub source: u32,
    pub destination: u32,
    pub bitrate: Option<u32>,
    pub rssi: i32,
    pub integrity: i32,
    /// Propagation delay in microseconds (burst receptions).
    pub delay: Option<u64>,
    /// Reception duration in microseconds (instant messages).
    pub duration: Option<u64>,
    pub velocity: f64,
    /// Whether the sender requested an acknowledgement (instant messages).
    pub ack_requested: Option<bool>,
}

/// A structurally complete response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<K> {
    pub kind: K,
    pub start: usize,
    /// Offset of the first byte after the response.
    pub end: usize,
    pub payload: Vec<u8>,
    pub rx: Option<RxInfo>,
    pub integrity: bool,
}

impl<K> Response<K> {
    pub fn new(kind: K, start: usize, end: usize) -> Self {
        Self {
            kind,
            start,
            end,
            payload: Vec::new(),
            rx: None,
            integrity: true,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<K> {
    /// More bytes are needed; nothing may be consumed.
    Incomplete,
    Complete(Response<K>),
}

impl<K> ParseOutcome<K> {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseOutcome::Incomplete)
    }
}

/// A device dialect.
pub trait Interpreter: Send + Sync + 'static {
    type Kind: Copy + Eq + Debug + Send + Sync + 'static;

    fn find_response(&self, buf: &[u8]) -> Option<Found<Self::Kind>>;

    fn parse_response(&self, found: &Found<Self::Kind>, buf: &[u8]) -> ParseOutcome<Self::Kind>;

    /// Finds and parses the earliest response in one go.
    fn next_response(&self, buf: &[u8]) -> Option<ParseOutcome<Self::Kind>> {
        self.find_response(buf).map(|found| self.parse_response(&found, buf))
    }
}

/// Walks comma terminated fields. Every accessor returns `None` when the
/// field is not there yet or does not parse.
pub(crate) struct FieldCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    pub fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn field(&mut self) -> Option<&'a [u8]> {
        let rest = self.buf.get(self.pos..)?;
        let len = rest.iter().position(|&b| b == b',')?;
        self.pos += len + 1;
        Some(&rest[..len])
    }

    pub fn number<T: FromStr>(&mut self) -> Option<T> {
        let raw = self.field()?;
        std::str::from_utf8(raw).ok()?.trim().parse().ok()
    }

    pub fn text(&mut self) -> Option<&'a str> {
        std::str::from_utf8(self.field()?).ok()
    }

    /// Takes exactly `len` raw bytes.
    pub fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    /// Consumes `literal` if it is fully present at the current position.
    pub fn expect(&mut self, literal: &[u8]) -> Option<()> {
        let end = self.pos + literal.len();
        if self.buf.get(self.pos..end)? == literal {
            self.pos = end;
            Some(())
        } else {
            None
        }
    }
}

/// Parses `len,src,dst,bitrate,rssi,integrity,delay,velocity,<payload>\r\n`
/// starting right after a `RECV,` token.
pub(crate) fn parse_recv_body(buf: &[u8], body: usize) -> Option<(RxInfo, Vec<u8>, usize)> {
    let mut cursor = FieldCursor::new(buf, body);
    let length: usize = cursor.number()?;
    let source = cursor.number()?;
    let destination = cursor.number()?;
    let bitrate = cursor.number()?;
    let rssi = cursor.number()?;
    let integrity = cursor.number()?;
    let delay = cursor.number()?;
    let velocity = cursor.number()?;
    let payload = cursor.take(length)?.to_vec();
    cursor.expect(CRLF)?;
    let info = RxInfo {
        length,
        source,
        destination,
        bitrate: Some(bitrate),
        rssi,
        integrity,
        delay: Some(delay),
        duration: None,
        velocity,
        ack_requested: None,
    };
    Some((info, payload, cursor.position()))
}
