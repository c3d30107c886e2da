//! Applicon SEA modem dialect.
//!
//! Outbound frames are JSON objects without terminator:
//! `{"cmd": "send", "payload": [104,105]}`. The modem answers with
//! `{"cmd": "oook"}` once a frame is accepted and reports receptions either as
//! `{"cmd": "msgs", "payload": [..., crc], "crc_check": true}` or as an
//! S2C-style `RECV,...` line.

use super::{Found, Interpreter, ParseOutcome, Response, TokenTable, parse_recv_body};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliconResponse {
    Recv,
    Msgs,
    Ack,
}

pub const APPLICON_TOKENS: [(&str, AppliconResponse); 3] = [
    ("RECV,", AppliconResponse::Recv),
    ("\"cmd\": \"msgs\"", AppliconResponse::Msgs),
    ("\"cmd\": \"oook\"", AppliconResponse::Ack),
];

#[derive(Debug, Deserialize)]
struct MsgsFrame {
    /// Elements outside `0..=255` keep their low byte.
    payload: Vec<i64>,
    #[serde(default = "crc_ok")]
    crc_check: bool,
}

fn crc_ok() -> bool {
    true
}

#[derive(Debug)]
pub struct AppliconInterpreter {
    table: TokenTable<AppliconResponse>,
}

impl Default for AppliconInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl AppliconInterpreter {
    pub fn new() -> Self {
        Self {
            table: TokenTable::new(&APPLICON_TOKENS),
        }
    }

    /// JSON send frame with the payload as a byte array.
    pub fn build_send(&self, payload: &[u8]) -> Vec<u8> {
        let bytes: Vec<String> = payload.iter().map(u8::to_string).collect();
        format!("{{\"cmd\": \"send\", \"payload\": [{}]}}", bytes.join(",")).into_bytes()
    }

    /// Extracts the payload of a send frame, as a loopback modem would.
    pub fn decode_send(&self, frame: &[u8]) -> Option<Vec<u8>> {
        #[derive(Deserialize)]
        struct Incoming {
            cmd: String,
            payload: Vec<u8>,
        }
        let incoming: Incoming = serde_json::from_slice(frame).ok()?;
        (incoming.cmd == "send").then_some(incoming.payload)
    }

    /// Span of the JSON object around a token: the nearest `{` before it (or
    /// the token itself) up to the first `}` after it.
    fn object_span(buf: &[u8], found: &Found<AppliconResponse>) -> Option<(usize, usize)> {
        let close = found.body() + buf[found.body()..].iter().position(|&b| b == b'}')?;
        let open = buf[..found.start].iter().rposition(|&b| b == b'{' || b == b'}');
        let open = match open {
            Some(i) if buf[i] == b'{' => i,
            _ => found.start,
        };
        Some((open, close + 1))
    }

    /// Payload and integrity flag of a closed `msgs` object. An object that
    /// does not decode comes back empty and flagged as corrupted.
    fn parse_msgs(&self, buf: &[u8], open: usize, end: usize) -> (Vec<u8>, bool) {
        let mut json = Vec::with_capacity(end - open + 1);
        if buf[open] != b'{' {
            json.push(b'{');
        }
        json.extend_from_slice(&buf[open..end]);
        let Ok(frame) = serde_json::from_slice::<MsgsFrame>(&json) else {
            return (Vec::new(), false);
        };
        let mut payload: Vec<u8> = frame.payload.into_iter().map(|b| b as u8).collect();
        // The last element is the CRC byte, when there is one.
        payload.pop();
        (payload, frame.crc_check)
    }
}

impl Interpreter for AppliconInterpreter {
    type Kind = AppliconResponse;

    fn find_response(&self, buf: &[u8]) -> Option<Found<AppliconResponse>> {
        self.table.find(buf)
    }

    fn parse_response(&self, found: &Found<AppliconResponse>, buf: &[u8]) -> ParseOutcome<AppliconResponse> {
        let response = match found.kind {
            AppliconResponse::Recv => parse_recv_body(buf, found.body()).map(|(info, payload, end)| {
                let mut response = Response::new(found.kind, found.start, end).with_payload(payload);
                response.integrity = info.integrity != 0;
                response.rx = Some(info);
                response
            }),
            AppliconResponse::Ack => Self::object_span(buf, found)
                .map(|(open, end)| Response::new(found.kind, found.start, end).with_payload(buf[open..end].to_vec())),
            AppliconResponse::Msgs => Self::object_span(buf, found).map(|(open, end)| {
                let (payload, integrity) = self.parse_msgs(buf, open, end);
                let mut response = Response::new(found.kind, found.start, end).with_payload(payload);
                response.integrity = integrity;
                response
            }),
        };
        match response {
            Some(response) => ParseOutcome::Complete(response),
            None => ParseOutcome::Incomplete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn parse_all(interp: &AppliconInterpreter, buf: &[u8]) -> ParseOutcome<AppliconResponse> {
        let found = interp.find_response(buf).expect("token");
        interp.parse_response(&found, buf)
    }

    #[test]
    fn test_build_send() {
        let interp = AppliconInterpreter::new();
        let frame = interp.build_send(b"hi");
        assert_eq!(frame, br#"{"cmd": "send", "payload": [104,105]}"#);
        assert_eq!(interp.decode_send(&frame), Some(vec![0x68, 0x69]));
        assert_eq!(interp.build_send(b""), br#"{"cmd": "send", "payload": []}"#);
    }

    #[test]
    fn test_send_round_trip_random_payloads() {
        let interp = AppliconInterpreter::new();
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let len = rng.gen_range(0..200);
            let payload: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            assert_eq!(interp.decode_send(&interp.build_send(&payload)), Some(payload));
        }
    }

    #[test]
    fn test_ack() {
        let interp = AppliconInterpreter::new();
        let buf = br#"{"cmd": "oook"}{"cmd": "#;
        let ParseOutcome::Complete(response) = parse_all(&interp, buf) else {
            panic!("expected ack");
        };
        assert_eq!(response.kind, AppliconResponse::Ack);
        assert_eq!(response.payload, br#"{"cmd": "oook"}"#);
        assert_eq!(response.end, 15);
        assert!(parse_all(&interp, br#"{"cmd": "oook""#).is_incomplete());
    }

    #[test]
    fn test_msgs_drops_crc_and_reads_integrity() {
        let interp = AppliconInterpreter::new();
        let buf = br#"{"cmd": "msgs", "payload": [104,105,77], "crc_check": false}"#;
        let ParseOutcome::Complete(response) = parse_all(&interp, buf) else {
            panic!("expected msgs");
        };
        assert_eq!(response.kind, AppliconResponse::Msgs);
        assert_eq!(response.payload, vec![0x68, 0x69]);
        assert!(!response.integrity);
        assert_eq!(response.end, buf.len());
    }

    #[test]
    fn test_msgs_defaults() {
        let interp = AppliconInterpreter::new();
        let ParseOutcome::Complete(response) = parse_all(&interp, br#"{"cmd": "msgs", "payload": [1,2,3]}"#) else {
            panic!("expected msgs");
        };
        assert!(response.integrity);
        assert_eq!(response.payload, vec![1, 2]);

        let ParseOutcome::Complete(empty) = parse_all(&interp, br#"{"cmd": "msgs", "payload": []}"#) else {
            panic!("expected msgs");
        };
        assert!(empty.payload.is_empty());
    }

    #[test]
    fn test_msgs_byte_by_byte() {
        let interp = AppliconInterpreter::new();
        let frame = br#"{"cmd": "msgs", "payload": [104,105,0], "crc_check": true}"#;
        let mut completions = 0;
        for cut in 1..=frame.len() {
            let prefix = &frame[..cut];
            let Some(found) = interp.find_response(prefix) else {
                continue;
            };
            if let ParseOutcome::Complete(response) = interp.parse_response(&found, prefix) {
                assert_eq!(cut, frame.len());
                assert_eq!(response.payload, b"hi");
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
    }

    #[test]
    fn test_msgs_wide_elements_keep_low_byte() {
        let interp = AppliconInterpreter::new();
        let ParseOutcome::Complete(response) = parse_all(&interp, br#"{"cmd": "msgs", "payload": [104,361,-1,300]}"#) else {
            panic!("expected msgs");
        };
        assert_eq!(response.payload, vec![104, 105, 255]);
        assert!(response.integrity);
    }

    #[test]
    fn test_malformed_msgs_is_consumed_as_corrupted() {
        let interp = AppliconInterpreter::new();
        let buf = br#"{"cmd": "msgs", "crc_check": true}{"cmd": "oook"}"#;
        let ParseOutcome::Complete(bad) = parse_all(&interp, buf) else {
            panic!("a closed object must not wait for more bytes");
        };
        assert!(!bad.integrity);
        assert!(bad.payload.is_empty());
        let ParseOutcome::Complete(ack) = parse_all(&interp, &buf[bad.end..]) else {
            panic!("expected the ack behind it");
        };
        assert_eq!(ack.kind, AppliconResponse::Ack);

        let ParseOutcome::Complete(text) = parse_all(&interp, br#"{"cmd": "msgs", "payload": ["a"]}"#) else {
            panic!("expected msgs");
        };
        assert!(!text.integrity);
    }

    #[test]
    fn test_recv_line() {
        let interp = AppliconInterpreter::new();
        let buf = b"noise RECV,2,4,1,500,-70,0,12,1.5,hi\r\n";
        let ParseOutcome::Complete(response) = parse_all(&interp, buf) else {
            panic!("expected recv");
        };
        assert_eq!(response.kind, AppliconResponse::Recv);
        assert_eq!(response.start, 6);
        assert_eq!(response.payload, b"hi");
        assert!(!response.integrity);
    }
}
