//! ahoi! modem dialect.
//!
//! Every message is a binary packet framed as `DLE STX <packet> DLE ETX`.
//! A DLE byte inside the packet is sent twice. The packet itself is a
//! 6 byte header (`src dst type status dsn len`), `len` payload bytes and,
//! on receptions, a 6 byte footer with the link quality figures.

use super::{Found, Interpreter, ParseOutcome, Response};
use std::fmt;
use std::str::FromStr;

pub const DLE: u8 = 0x10;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

pub const HEADER_LEN: usize = 6;
pub const FOOTER_LEN: usize = 6;
/// Largest payload a single packet carries.
pub const PAYLOAD_MAX_LEN: usize = 128;

/// Destination address every modem accepts.
pub const BROADCAST: u8 = 0xFF;
/// Highest packet type that carries user data.
pub const MAX_DATA_TYPE: u8 = 0x7E;

pub const ACK_NONE: u8 = 0x00;

/// Packet types understood by the modem firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AhoiCommand {
    Send,
    Confirm,
    Id,
    BatteryVoltage,
    Reset,
    Agc,
    RxGain,
    TxGain,
    RangeDelay,
    Distance,
    PacketStat,
    PacketStatReset,
    SyncStat,
    SyncStatReset,
    SfdStat,
    SfdStatReset,
    AllStat,
    AllStatReset,
}

const NAMED_COMMANDS: [(&str, AhoiCommand); 16] = [
    ("id", AhoiCommand::Id),
    ("batvol", AhoiCommand::BatteryVoltage),
    ("reset", AhoiCommand::Reset),
    ("agc", AhoiCommand::Agc),
    ("rxgain", AhoiCommand::RxGain),
    ("txgain", AhoiCommand::TxGain),
    ("rangedelay", AhoiCommand::RangeDelay),
    ("distance", AhoiCommand::Distance),
    ("packetstat", AhoiCommand::PacketStat),
    ("packetstatreset", AhoiCommand::PacketStatReset),
    ("syncstat", AhoiCommand::SyncStat),
    ("syncstatreset", AhoiCommand::SyncStatReset),
    ("sfdstat", AhoiCommand::SfdStat),
    ("sfdstatreset", AhoiCommand::SfdStatReset),
    ("allstat", AhoiCommand::AllStat),
    ("allstatreset", AhoiCommand::AllStatReset),
];

impl AhoiCommand {
    /// Value of the header `type` field.
    pub fn type_id(self) -> u8 {
        match self {
            AhoiCommand::Send => 0x00,
            AhoiCommand::Id => 0x84,
            AhoiCommand::BatteryVoltage => 0x85,
            AhoiCommand::Reset => 0x87,
            AhoiCommand::Agc => 0x98,
            AhoiCommand::RxGain => 0x99,
            AhoiCommand::TxGain => 0x9A,
            AhoiCommand::RangeDelay => 0xA8,
            AhoiCommand::Distance => 0xA9,
            AhoiCommand::PacketStat => 0xC0,
            AhoiCommand::PacketStatReset => 0xC1,
            AhoiCommand::SyncStat => 0xC2,
            AhoiCommand::SyncStatReset => 0xC3,
            AhoiCommand::SfdStat => 0xC4,
            AhoiCommand::SfdStatReset => 0xC5,
            AhoiCommand::AllStat => 0xC6,
            AhoiCommand::AllStatReset => 0xC7,
            AhoiCommand::Confirm => 0xFF,
        }
    }

    /// Any type up to [`MAX_DATA_TYPE`] is a data packet.
    pub fn from_type(type_id: u8) -> Option<Self> {
        if type_id <= MAX_DATA_TYPE {
            return Some(AhoiCommand::Send);
        }
        if type_id == AhoiCommand::Confirm.type_id() {
            return Some(AhoiCommand::Confirm);
        }
        NAMED_COMMANDS.iter().map(|&(_, cmd)| cmd).find(|cmd| cmd.type_id() == type_id)
    }

    pub fn name(self) -> &'static str {
        match self {
            AhoiCommand::Send => "send",
            AhoiCommand::Confirm => "confirm",
            _ => NAMED_COMMANDS
                .iter()
                .find(|&&(_, cmd)| cmd == self)
                .map_or("unknown", |&(name, _)| name),
        }
    }
}

impl fmt::Display for AhoiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ahoi! command `{0}`")]
pub struct UnknownCommand(String);

/// Parses the device queries a user may issue, e.g. `batvol`.
impl FromStr for AhoiCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NAMED_COMMANDS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|&(_, cmd)| cmd)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AhoiHeader {
    pub src: u8,
    pub dst: u8,
    pub type_id: u8,
    pub status: u8,
    pub dsn: u8,
    pub len: u8,
}

/// Link quality reported with a reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AhoiFooter {
    pub power: u8,
    pub rssi: u8,
    pub bit_errors: u8,
    pub agc_mean: u8,
    pub agc_min: u8,
    pub agc_max: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AhoiPacket {
    pub header: AhoiHeader,
    pub payload: Vec<u8>,
    pub footer: Option<AhoiFooter>,
}

impl AhoiPacket {
    /// A packet carrying no payload, as every device query is.
    pub fn command(cmd: AhoiCommand, src: u8, dsn: u8) -> Self {
        Self {
            header: AhoiHeader {
                src,
                dst: BROADCAST,
                type_id: cmd.type_id(),
                status: ACK_NONE,
                dsn,
                len: 0,
            },
            payload: Vec::new(),
            footer: None,
        }
    }

    pub fn command_kind(&self) -> Option<AhoiCommand> {
        AhoiCommand::from_type(self.header.type_id)
    }

    /// Unescaped packet bytes: header, payload and footer when present.
    pub fn to_bytes(&self) -> Vec<u8> {
        let h = &self.header;
        let mut raw = vec![h.src, h.dst, h.type_id, h.status, h.dsn, h.len];
        raw.extend_from_slice(&self.payload);
        if let Some(f) = &self.footer {
            raw.extend_from_slice(&[f.power, f.rssi, f.bit_errors, f.agc_mean, f.agc_min, f.agc_max]);
        }
        raw
    }

    /// Decodes unescaped packet bytes. `None` when the header is cut short or
    /// announces more payload than there is.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let head = raw.get(..HEADER_LEN)?;
        let header = AhoiHeader {
            src: head[0],
            dst: head[1],
            type_id: head[2],
            status: head[3],
            dsn: head[4],
            len: head[5],
        };
        let payload_end = HEADER_LEN + usize::from(header.len);
        let payload = raw.get(HEADER_LEN..payload_end)?.to_vec();
        let footer = raw.get(payload_end..payload_end + FOOTER_LEN).map(|f| AhoiFooter {
            power: f[0],
            rssi: f[1],
            bit_errors: f[2],
            agc_mean: f[3],
            agc_min: f[4],
            agc_max: f[5],
        });
        Some(Self { header, payload, footer })
    }

    /// Framed and escaped wire form.
    pub fn encode(&self) -> Vec<u8> {
        let raw = self.to_bytes();
        let mut frame = Vec::with_capacity(raw.len() + 8);
        frame.extend_from_slice(&[DLE, STX]);
        for byte in raw {
            if byte == DLE {
                frame.push(DLE);
            }
            frame.push(byte);
        }
        frame.extend_from_slice(&[DLE, ETX]);
        frame
    }
}

/// Only marker for this dialect: a frame start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhoiFrame {
    Packet,
}

#[derive(Debug, Default)]
pub struct AhoiInterpreter;

impl AhoiInterpreter {
    pub fn new() -> Self {
        Self
    }

    /// Data packet for `dst`. `None` when the payload does not fit a packet.
    pub fn build_send(&self, src: u8, dst: u8, dsn: u8, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() > PAYLOAD_MAX_LEN {
            return None;
        }
        let packet = AhoiPacket {
            header: AhoiHeader {
                src,
                dst,
                type_id: AhoiCommand::Send.type_id(),
                status: ACK_NONE,
                dsn,
                len: payload.len() as u8,
            },
            payload: payload.to_vec(),
            footer: None,
        };
        Some(packet.encode())
    }

    pub fn build_command(&self, cmd: AhoiCommand, src: u8, dsn: u8) -> Vec<u8> {
        AhoiPacket::command(cmd, src, dsn).encode()
    }
}

impl Interpreter for AhoiInterpreter {
    type Kind = AhoiFrame;

    /// First `DLE STX` that is not the tail of an escaped DLE.
    fn find_response(&self, buf: &[u8]) -> Option<Found<AhoiFrame>> {
        let mut i = 0;
        while i + 1 < buf.len() {
            if buf[i] == DLE {
                match buf[i + 1] {
                    STX => {
                        return Some(Found {
                            kind: AhoiFrame::Packet,
                            start: i,
                            token_len: 2,
                        });
                    }
                    DLE => {
                        i += 2;
                        continue;
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        None
    }

    /// The payload of the response is the unescaped packet, ready for
    /// [`AhoiPacket::decode`]. A frame cut off by a new `DLE STX` is returned
    /// up to that point with `integrity` cleared.
    fn parse_response(&self, found: &Found<AhoiFrame>, buf: &[u8]) -> ParseOutcome<AhoiFrame> {
        let mut raw = Vec::new();
        let mut i = found.body();
        while i < buf.len() {
            if buf[i] != DLE {
                raw.push(buf[i]);
                i += 1;
                continue;
            }
            let Some(&next) = buf.get(i + 1) else {
                break;
            };
            match next {
                DLE => {
                    raw.push(DLE);
                    i += 2;
                }
                ETX => {
                    return ParseOutcome::Complete(Response::new(found.kind, found.start, i + 2).with_payload(raw));
                }
                STX => {
                    let mut response = Response::new(found.kind, found.start, i).with_payload(raw);
                    response.integrity = false;
                    return ParseOutcome::Complete(response);
                }
                _ => {
                    raw.push(DLE);
                    i += 1;
                }
            }
        }
        ParseOutcome::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn parse(buf: &[u8]) -> ParseOutcome<AhoiFrame> {
        let interp = AhoiInterpreter::new();
        let found = interp.find_response(buf).expect("frame start");
        interp.parse_response(&found, buf)
    }

    fn reception(src: u8, dst: u8, payload: &[u8]) -> AhoiPacket {
        AhoiPacket {
            header: AhoiHeader {
                src,
                dst,
                type_id: 0,
                status: 0,
                dsn: 9,
                len: payload.len() as u8,
            },
            payload: payload.to_vec(),
            footer: Some(AhoiFooter {
                power: 1,
                rssi: 42,
                bit_errors: 0,
                agc_mean: 3,
                agc_min: 2,
                agc_max: 4,
            }),
        }
    }

    #[test]
    fn test_build_send_escapes_dle() {
        let interp = AhoiInterpreter::new();
        let frame = interp.build_send(DLE, 2, 5, &[DLE, 0x41]).unwrap();
        assert_eq!(frame, vec![DLE, STX, DLE, DLE, 2, 0, 0, 5, 2, DLE, DLE, 0x41, DLE, ETX]);
        assert!(interp.build_send(1, 2, 0, &[0u8; PAYLOAD_MAX_LEN]).is_some());
        assert!(interp.build_send(1, 2, 0, &[0u8; PAYLOAD_MAX_LEN + 1]).is_none());
    }

    #[test]
    fn test_build_command() {
        let interp = AhoiInterpreter::new();
        assert_eq!(interp.build_command(AhoiCommand::BatteryVoltage, 7, 3), vec![DLE, STX, 7, BROADCAST, 0x85, 0, 3, 0, DLE, ETX]);
    }

    #[test]
    fn test_reception_with_footer() {
        let packet = reception(4, 1, b"hi");
        let buf = [b"noise".as_slice(), &packet.encode(), &[DLE, STX, 1]].concat();
        let ParseOutcome::Complete(response) = parse(&buf) else {
            panic!("expected a frame");
        };
        assert_eq!(response.start, 5);
        assert_eq!(response.end, 5 + packet.encode().len());
        assert!(response.integrity);
        assert_eq!(AhoiPacket::decode(&response.payload), Some(packet));
    }

    #[test]
    fn test_random_payloads_survive_framing() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let len = rng.gen_range(0..=PAYLOAD_MAX_LEN);
            let mut payload: Vec<u8> = (0..len).map(|_| rng.gen_range(0..=255u8)).collect();
            if len > 1 {
                // Make sure escaped sequences that look like markers show up.
                payload[0] = DLE;
                payload[1] = STX;
            }
            let packet = reception(rng.gen_range(0..=255u8), BROADCAST, &payload);
            let ParseOutcome::Complete(response) = parse(&packet.encode()) else {
                panic!("incomplete frame");
            };
            assert_eq!(AhoiPacket::decode(&response.payload), Some(packet));
        }
    }

    #[test]
    fn test_every_prefix_is_incomplete() {
        let frame = reception(DLE, DLE, &[DLE, ETX, DLE]).encode();
        let interp = AhoiInterpreter::new();
        for cut in 2..frame.len() {
            let found = interp.find_response(&frame[..cut]).unwrap();
            assert_eq!(found.start, 0);
            assert!(interp.parse_response(&found, &frame[..cut]).is_incomplete(), "prefix {} parsed", cut);
        }
        assert!(interp.find_response(&[DLE]).is_none());
    }

    #[test]
    fn test_escaped_dle_before_stx_is_not_a_frame_start() {
        let interp = AhoiInterpreter::new();
        assert!(interp.find_response(&[DLE, DLE, STX, 0x41]).is_none());
        let found = interp.find_response(&[DLE, DLE, STX, DLE, STX]).unwrap();
        assert_eq!(found.start, 3);
    }

    #[test]
    fn test_frame_cut_short_by_new_start() {
        let mut buf = vec![DLE, STX, 1, 2, 0];
        let next = reception(3, 4, b"ok").encode();
        buf.extend_from_slice(&next);
        let ParseOutcome::Complete(cut) = parse(&buf) else {
            panic!("expected the truncated frame");
        };
        assert!(!cut.integrity);
        assert_eq!(cut.end, 5);
        assert_eq!(AhoiPacket::decode(&cut.payload), None);

        let ParseOutcome::Complete(whole) = parse(&buf[cut.end..]) else {
            panic!("expected the next frame");
        };
        assert_eq!(AhoiPacket::decode(&whole.payload).unwrap().payload, b"ok");
    }

    #[test]
    fn test_decode_without_footer() {
        let raw = [1, 2, 0, 0, 7, 3, b'a', b'b', b'c'];
        let packet = AhoiPacket::decode(&raw).unwrap();
        assert_eq!(packet.header.dsn, 7);
        assert_eq!(packet.payload, b"abc");
        assert_eq!(packet.footer, None);
        assert_eq!(packet.to_bytes(), raw);
        assert_eq!(AhoiPacket::decode(&raw[..8]), None);
        assert_eq!(AhoiPacket::decode(&raw[..5]), None);
    }

    #[test]
    fn test_command_types() {
        assert_eq!(AhoiCommand::from_type(0x00), Some(AhoiCommand::Send));
        assert_eq!(AhoiCommand::from_type(0x42), Some(AhoiCommand::Send));
        assert_eq!(AhoiCommand::from_type(0xFF), Some(AhoiCommand::Confirm));
        assert_eq!(AhoiCommand::from_type(0xC6), Some(AhoiCommand::AllStat));
        assert_eq!(AhoiCommand::from_type(0x7F), None);
        assert_eq!(AhoiCommand::from_type(0x90), None);
        assert_eq!("BatVol".parse::<AhoiCommand>(), Ok(AhoiCommand::BatteryVoltage));
        assert!("send".parse::<AhoiCommand>().is_err());
        assert_eq!(AhoiCommand::SfdStatReset.to_string(), "sfdstatreset");
        assert_eq!(AhoiCommand::Confirm.name(), "confirm");
    }
}
