//! MODA signaling channel.
//!
//! The modem reports phase changes on a side channel with messages such as
//! `DRIVER::RX_STARTED::42;`, `DRIVER::TX_ENDED;` or `DRIVER::CFG_ENDED;`.
//! Only messages carrying the `DRIVER` tag are addressed to us.

use super::{Found, Interpreter, ParseOutcome, Response, RxInfo, TokenTable, find_bytes};

pub const SIGNAL_TAG: &[u8] = b"DRIVER";
pub const SIGNAL_SEP: &[u8] = b"::";
pub const SIGNAL_END: u8 = b';';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModaSignal {
    /// Reception started; the size follows the token.
    RxBegin,
    TxEnd,
    CfgEnd,
    /// A complete message not addressed to the driver.
    Untagged,
}

pub const MODA_TOKENS: [(&str, ModaSignal); 3] = [
    ("RX_STARTED", ModaSignal::RxBegin),
    ("TX_ENDED", ModaSignal::TxEnd),
    ("CFG_ENDED", ModaSignal::CfgEnd),
];

#[derive(Debug)]
pub struct ModaInterpreter {
    table: TokenTable<ModaSignal>,
}

impl Default for ModaInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModaInterpreter {
    pub fn new() -> Self {
        Self {
            table: TokenTable::new(&MODA_TOKENS),
        }
    }

    /// Builds a signaling message, as the modem side sends it.
    pub fn build_signal(&self, signal: ModaSignal, size: Option<usize>) -> Vec<u8> {
        let name = MODA_TOKENS.iter().find(|(_, s)| *s == signal).map_or("", |(token, _)| token);
        let mut msg = Vec::new();
        msg.extend_from_slice(SIGNAL_TAG);
        msg.extend_from_slice(SIGNAL_SEP);
        msg.extend_from_slice(name.as_bytes());
        if let Some(size) = size {
            msg.extend_from_slice(SIGNAL_SEP);
            msg.extend_from_slice(size.to_string().as_bytes());
        }
        msg.push(SIGNAL_END);
        msg
    }
}

impl Interpreter for ModaInterpreter {
    type Kind = ModaSignal;

    fn find_response(&self, buf: &[u8]) -> Option<Found<ModaSignal>> {
        self.table.find(buf)
    }

    fn parse_response(&self, found: &Found<ModaSignal>, buf: &[u8]) -> ParseOutcome<ModaSignal> {
        let Some(offset) = buf[found.body()..].iter().position(|&b| b == SIGNAL_END) else {
            return ParseOutcome::Incomplete;
        };
        let msg_end = found.body() + offset;
        let msg_start = buf[..found.start].iter().rposition(|&b| b == SIGNAL_END).map_or(0, |i| i + 1);
        let end = msg_end + 1;

        if find_bytes(&buf[msg_start..found.start], SIGNAL_TAG).is_none() {
            return ParseOutcome::Complete(Response::new(ModaSignal::Untagged, found.start, end));
        }

        let mut response = Response::new(found.kind, found.start, end).with_payload(buf[msg_start..msg_end].to_vec());
        if found.kind == ModaSignal::RxBegin {
            let size = buf[found.body()..msg_end]
                .strip_prefix(SIGNAL_SEP)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|raw| raw.trim().parse::<usize>().ok());
            let Some(size) = size else {
                return ParseOutcome::Incomplete;
            };
            response.rx = Some(RxInfo {
                length: size,
                ..RxInfo::default()
            });
        }
        ParseOutcome::Complete(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(buf: &[u8]) -> ParseOutcome<ModaSignal> {
        let interp = ModaInterpreter::new();
        let found = interp.find_response(buf).expect("token");
        interp.parse_response(&found, buf)
    }

    #[test]
    fn test_rx_started_carries_size() {
        let ParseOutcome::Complete(response) = parse_all(b"DRIVER::RX_STARTED::42;DRIVER::TX") else {
            panic!("expected RX_STARTED");
        };
        assert_eq!(response.kind, ModaSignal::RxBegin);
        assert_eq!(response.rx.unwrap().length, 42);
        assert_eq!(response.end, 23);
    }

    #[test]
    fn test_incomplete_until_delimiter() {
        assert!(parse_all(b"DRIVER::RX_STARTED::4").is_incomplete());
        assert!(parse_all(b"DRIVER::TX_ENDED").is_incomplete());
    }

    #[test]
    fn test_untagged_messages_are_skipped() {
        let ParseOutcome::Complete(response) = parse_all(b"GUI::TX_ENDED;") else {
            panic!("expected a complete message");
        };
        assert_eq!(response.kind, ModaSignal::Untagged);
        assert_eq!(response.end, 14);
    }

    #[test]
    fn test_build_signal() {
        let interp = ModaInterpreter::new();
        assert_eq!(interp.build_signal(ModaSignal::RxBegin, Some(7)), b"DRIVER::RX_STARTED::7;");
        assert_eq!(interp.build_signal(ModaSignal::CfgEnd, None), b"DRIVER::CFG_ENDED;");
        let ParseOutcome::Complete(response) = parse_all(&interp.build_signal(ModaSignal::TxEnd, None)) else {
            panic!("expected TX_ENDED");
        };
        assert_eq!(response.kind, ModaSignal::TxEnd);
    }
}
