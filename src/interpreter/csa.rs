//! CSA modem framing: `PACKET,<len>,<payload>,EPCK` in both directions.
//!
//! The length field frames the payload, so the payload may itself contain
//! `PACKET,` or `EPCK`.

use super::{FieldCursor, Found, Interpreter, ParseOutcome, Response, TokenTable};

const FRAME_BEGIN: &str = "PACKET,";
const FRAME_END: &[u8] = b",EPCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsaResponse {
    Packet,
}

#[derive(Debug)]
pub struct CsaInterpreter {
    table: TokenTable<CsaResponse>,
}

impl Default for CsaInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl CsaInterpreter {
    pub fn new() -> Self {
        Self {
            table: TokenTable::new(&[(FRAME_BEGIN, CsaResponse::Packet)]),
        }
    }

    pub fn build_send(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = format!("{}{},", FRAME_BEGIN, payload.len()).into_bytes();
        frame.extend_from_slice(payload);
        frame.extend_from_slice(FRAME_END);
        frame
    }
}

impl Interpreter for CsaInterpreter {
    type Kind = CsaResponse;

    fn find_response(&self, buf: &[u8]) -> Option<Found<CsaResponse>> {
        self.table.find(buf)
    }

    fn parse_response(&self, found: &Found<CsaResponse>, buf: &[u8]) -> ParseOutcome<CsaResponse> {
        let mut cursor = FieldCursor::new(buf, found.body());
        let parsed = cursor.number::<usize>().and_then(|len| {
            let payload = cursor.take(len)?.to_vec();
            cursor.expect(FRAME_END)?;
            Some(payload)
        });
        match parsed {
            Some(payload) => ParseOutcome::Complete(Response::new(found.kind, found.start, cursor.position()).with_payload(payload)),
            None => ParseOutcome::Incomplete,
        }
    }
}
