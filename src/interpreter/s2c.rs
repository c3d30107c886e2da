//! EvoLogics S2C AT command dialect.
//!
//! Commands end with `\n`, responses with `\r\n`. Data arrives as
//! `RECV,len,src,dst,bitrate,rssi,integrity,delay,velocity,<payload>\r\n`
//! (burst) or `RECVIM,len,src,dst,ack|noack,duration,rssi,integrity,velocity,<payload>\r\n`
//! (instant message). Payloads are framed by their length field, so they may
//! contain any byte including other tokens or line terminators.

use super::{CRLF, FieldCursor, Found, Interpreter, ParseOutcome, Response, RxInfo, TokenTable, find_bytes, parse_recv_body};
use std::collections::BTreeMap;

const W_TERM: &str = "\n";
const SEP: &str = ",";
/// Settings and status listings end with an empty line.
const BLOCK_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S2cResponse {
    RecvIm,
    Recv,
    Ok,
    Empty,
    Busy,
    Delivering,
    Delivered,
    DropCount,
    PhyOff,
    NotAccepted,
    WrongAddress,
    ConnectionClosed,
    Unknown,
    BufferNotEmpty,
    BufferFull,
    OutOfRange,
    ProtocolId,
    Internal,
    Failed,
    CurrSettings,
    ModemStatus,
    InitNoise,
    InitDeaf,
    InitListen,
    RecvStart,
    RecvEnd,
    RecvFailed,
    SendStart,
    SendEnd,
    Bitrate,
}

/// Response tokens in match priority order.
pub const S2C_TOKENS: [(&str, S2cResponse); 31] = [
    ("RECVIM,", S2cResponse::RecvIm),
    ("RECV,", S2cResponse::Recv),
    ("OK", S2cResponse::Ok),
    ("EMPTY", S2cResponse::Empty),
    ("BUSY", S2cResponse::Busy),
    ("DELIVERING", S2cResponse::Delivering),
    ("DELIVERED", S2cResponse::Delivered),
    ("DROPCNT", S2cResponse::DropCount),
    ("ERROR PHY OFF", S2cResponse::PhyOff),
    ("ERROR NOT ACCEPTED", S2cResponse::NotAccepted),
    ("ERROR WRONG DESTINATION ADDRESS", S2cResponse::WrongAddress),
    ("ERROR CONNECTION CLOSED", S2cResponse::ConnectionClosed),
    ("ERROR UNKNOWN COMMAND", S2cResponse::Unknown),
    ("ERROR WRONG FORMAT", S2cResponse::Unknown),
    ("ERROR BUFFER IS NOT EMPTY", S2cResponse::BufferNotEmpty),
    ("ERROR BUFFER FULL", S2cResponse::BufferFull),
    ("ERROR OUT OF RANGE", S2cResponse::OutOfRange),
    ("ERROR PROTOCOL ID", S2cResponse::ProtocolId),
    ("ERROR INTERNAL", S2cResponse::Internal),
    ("FAILED", S2cResponse::Failed),
    ("Source Level:", S2cResponse::CurrSettings),
    ("Remote Address:", S2cResponse::ModemStatus),
    ("INITIATION NOISE", S2cResponse::InitNoise),
    ("INITIATION DEAF", S2cResponse::InitDeaf),
    ("INITIATION LISTEN", S2cResponse::InitListen),
    ("RECVSTART", S2cResponse::RecvStart),
    ("RECVEND", S2cResponse::RecvEnd),
    ("RECVFAILED", S2cResponse::RecvFailed),
    ("SENDSTART", S2cResponse::SendStart),
    ("SENDEND", S2cResponse::SendEnd),
    ("BITRATE", S2cResponse::Bitrate),
];

#[derive(Debug)]
pub struct S2cInterpreter {
    table: TokenTable<S2cResponse>,
}

impl Default for S2cInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl S2cInterpreter {
    pub fn new() -> Self {
        Self {
            table: TokenTable::new(&S2C_TOKENS),
        }
    }

    /// `AT*SEND,<len>,<dest>,<payload>\n`
    pub fn build_send(&self, payload: &[u8], destination: u32) -> Vec<u8> {
        let mut cmd = format!("AT*SEND{SEP}{}{SEP}{}{SEP}", payload.len(), destination).into_bytes();
        cmd.extend_from_slice(payload);
        cmd.extend_from_slice(W_TERM.as_bytes());
        cmd
    }

    /// `AT*SENDIM,<len>,<dest>,ack|noack,<payload>\n`
    pub fn build_send_im(&self, payload: &[u8], destination: u32, ack: bool) -> Vec<u8> {
        let flag = if ack { "ack" } else { "noack" };
        let mut cmd = format!("AT*SENDIM{SEP}{}{SEP}{}{SEP}{}{SEP}", payload.len(), destination, flag).into_bytes();
        cmd.extend_from_slice(payload);
        cmd.extend_from_slice(W_TERM.as_bytes());
        cmd
    }

    /// Device reset, levels 0 to 4.
    pub fn build_atz(&self, level: u8) -> Option<Vec<u8>> {
        (level <= 4).then(|| command(&format!("ATZ{}", level)))
    }

    /// Delivery status query for the last instant message.
    pub fn build_atdi(&self) -> Vec<u8> {
        command("AT?DI")
    }

    pub fn build_ats(&self) -> Vec<u8> {
        command("AT?S")
    }

    pub fn build_atv(&self) -> Vec<u8> {
        command("AT&V")
    }

    pub fn build_get_source_level(&self) -> Vec<u8> {
        command("AT?L")
    }

    /// Source level 0 (loudest) to 4.
    pub fn build_set_source_level(&self, level: u8) -> Option<Vec<u8>> {
        (level <= 4).then(|| command(&format!("AT!L{}", level)))
    }

    pub fn build_get_local_address(&self) -> Vec<u8> {
        command("AT?AL")
    }

    /// Local acoustic address, 1 to 254.
    pub fn build_set_local_address(&self, address: u8) -> Option<Vec<u8>> {
        (1..=254).contains(&address).then(|| command(&format!("AT!AL{}", address)))
    }

    fn parse_recv_im(&self, buf: &[u8], body: usize) -> Option<(RxInfo, Vec<u8>, usize)> {
        let mut cursor = FieldCursor::new(buf, body);
        let length: usize = cursor.number()?;
        let source = cursor.number()?;
        let destination = cursor.number()?;
        let ack_requested = match cursor.text()? {
            "ack" => true,
            "noack" => false,
            _ => return None,
        };
        let duration = cursor.number()?;
        let rssi = cursor.number()?;
        let integrity = cursor.number()?;
        let velocity = cursor.number()?;
        let payload = cursor.take(length)?.to_vec();
        cursor.expect(CRLF)?;
        let info = RxInfo {
            length,
            source,
            destination,
            bitrate: None,
            rssi,
            integrity,
            delay: None,
            duration: Some(duration),
            velocity,
            ack_requested: Some(ack_requested),
        };
        Some((info, payload, cursor.position()))
    }
}

impl Interpreter for S2cInterpreter {
    type Kind = S2cResponse;

    fn find_response(&self, buf: &[u8]) -> Option<Found<S2cResponse>> {
        self.table.find(buf)
    }

    fn parse_response(&self, found: &Found<S2cResponse>, buf: &[u8]) -> ParseOutcome<S2cResponse> {
        let body = found.body();
        let response = match found.kind {
            S2cResponse::Recv | S2cResponse::RecvIm => {
                let parsed = if found.kind == S2cResponse::Recv {
                    parse_recv_body(buf, body)
                } else {
                    self.parse_recv_im(buf, body)
                };
                parsed.map(|(info, payload, end)| {
                    let mut response = Response::new(found.kind, found.start, end).with_payload(payload);
                    response.integrity = info.integrity != 0;
                    response.rx = Some(info);
                    response
                })
            }
            S2cResponse::CurrSettings | S2cResponse::ModemStatus => find_bytes(&buf[body..], BLOCK_END).map(|offset| {
                let block_end = body + offset;
                Response::new(found.kind, found.start, block_end + BLOCK_END.len()).with_payload(buf[found.start..block_end].to_vec())
            }),
            _ => find_bytes(&buf[body..], CRLF).map(|offset| {
                let line_end = body + offset;
                Response::new(found.kind, found.start, line_end + CRLF.len()).with_payload(buf[found.start..line_end].to_vec())
            }),
        };
        match response {
            Some(response) => ParseOutcome::Complete(response),
            None => ParseOutcome::Incomplete,
        }
    }
}

/// Splits a settings or status listing into `key -> value` pairs.
pub fn parse_key_values(block: &[u8]) -> BTreeMap<String, String> {
    String::from_utf8_lossy(block)
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn command(base: &str) -> Vec<u8> {
    format!("{}{}", base, W_TERM).into_bytes()
}
