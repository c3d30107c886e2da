//! Simulator-facing types.
//!
//! The host simulator is reached only through the [`PhysicalLayerPort`]
//! capability, so the same driver can sit under a discrete-event engine or
//! under the stdin/stdout harness in `main.rs`.
//!
//! - [`Packet`]: a simulated packet with its payload and physical layer stamps
//! - [`PhysicalLayerPort`]: upward delivery and MAC notifications
//! - [`adapter::ModemAdapter`]: lifecycle entry points and the event drain
//! - [`clock::VirtualClock`]: real time to simulation time mapping

pub mod adapter;
pub mod clock;

pub use adapter::ModemAdapter;
pub use clock::VirtualClock;

use crate::interpreter::RxInfo;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Towards the upper layers of the simulated stack.
    Up,
    /// Towards the device.
    #[default]
    Down,
}

/// Cartesian node position in metres.
pub type Position = (f64, f64, f64);

/// Physical layer header. The driver zeroes the power fields since the
/// real channel is not modelled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhyInfo {
    pub pr: f64,
    pub pn: f64,
    pub pi: f64,
    pub tx_time: f64,
    pub rx_time: f64,
    pub duration: f64,
    pub modulation_type: u32,
    pub src_position: Option<Position>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub uid: u64,
    pub direction: Direction,
    pub payload: Vec<u8>,
    pub mac_dest: u32,
    pub phy: PhyInfo,
    pub error: bool,
    /// Device metadata of a reception, when the dialect reports it.
    pub rx: Option<RxInfo>,
}

impl Packet {
    /// A packet travelling down to the device.
    pub fn outbound(payload: Vec<u8>, mac_dest: u32) -> Self {
        Self {
            uid: next_uid(),
            direction: Direction::Down,
            payload,
            mac_dest,
            phy: PhyInfo::default(),
            error: false,
            rx: None,
        }
    }

    /// A packet built from bytes the device delivered.
    pub fn received(payload: Vec<u8>, rx: Option<RxInfo>) -> Self {
        Self {
            uid: next_uid(),
            direction: Direction::Up,
            payload,
            mac_dest: rx.as_ref().map_or(0, |info| info.destination),
            phy: PhyInfo::default(),
            error: false,
            rx,
        }
    }
}

/// What the host simulator offers a physical layer.
pub trait PhysicalLayerPort {
    /// Current simulation time in seconds.
    fn now(&self) -> f64;

    fn position(&self) -> Option<Position> {
        None
    }

    /// Hands a packet to the layer above after `delay` seconds.
    fn send_up(&mut self, packet: Packet, delay: f64);

    fn notify_start_rx(&mut self, packet: &Packet);

    fn notify_end_tx(&mut self, packet: &Packet);

    /// Releases a packet the simulator no longer needs.
    fn free(&mut self, packet: Packet) {
        drop(packet);
    }
}
