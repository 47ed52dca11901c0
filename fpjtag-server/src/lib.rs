//! # FlashPro Companion Library
//!
//! This crate provides the companion side of the FlashPro JTAG transport: the
//! process that holds the programmer handle and executes the requests a client
//! sends over TCP.
//!
//! ## Overview
//!
//! A client queues JTAG operations (scans, state moves, run-test cycles, resets,
//! path moves and sleeps) and sends them one at a time. The companion executes each
//! operation on the programmer, either directly or tunnelled through a UJTAG
//! bridge to a TAP that is only reachable through framed DR scans, and answers
//! with a status code and any captured data.
//!
//! ## Architecture
//!
//! - **[`Programmer`] Trait**: the primitive operations of a programmer
//!   (TAP state, delays, scans, TRST, TCK frequency, port handling)
//! - **[`driver::Driver`]**: executes operations on a [`Programmer`], choosing the
//!   direct or the tunnelled path
//! - **[`tunnel::TunnelEncoder`]**: re-frames operations for the UJTAG bridge
//! - **[`executor::execute_queue`]**: runs a queue of operations in order and
//!   stops at the first failure
//! - **[`server::Server`]**: accepts a client connection, decodes requests and
//!   answers them
//! - **[`sim`]**: software programmers for development and tests
//!
//! ## Basic Usage
//!
//! ```ignore
//! use fpjtag_server::server::Builder;
//! use fpjtag_server::sim::Loopback;
//! use std::time::Duration;
//!
//! let mut server = Builder::new()
//!     .idle_timeout(Some(Duration::from_secs(120)))
//!     .build(Loopback::new());
//! server.listen("127.0.0.1:3334")?;
//! ```
//!
//! ## Error Handling
//!
//! Every request is answered with a status code. Driver failures are logged and
//! reported as a non-zero status; the companion keeps serving afterwards. A
//! failure in the middle of a tunnelled operation leaves the bridge's TAP in an
//! unknown state, and tunnelled operations are refused until a move to Reset.
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Per-operation lines are logged
//! at `debug` level, or at `info` level once a client enables logging.
//!
//! ## Thread Model
//!
//! The server handles one client and one request at a time in the calling thread.
//! The programmer is a serial resource, so requests are never executed concurrently.
use fpjtag_protocol::tap::{Register, TapState};

pub mod driver;
pub mod error;
pub mod executor;
pub mod profile;
pub mod server;
pub mod sim;
pub mod tunnel;

pub use error::HardwareError;

/// Level of a JTAG signal driven by the programmer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PinLevel {
    Low,
    High,
}

/// Static information reported by an opened programmer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgrammerInfo {
    pub kind: String,
    pub revision: String,
    pub connection: String,
    pub id: String,
}

/// Programmer families with different TCK frequency constraints.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProgrammerKind {
    FlashPro3,
    FlashPro4,
    FlashPro5,
    Unknown,
}

impl ProgrammerInfo {
    pub fn family(&self) -> ProgrammerKind {
        match self.kind.as_str() {
            "FlashPro3" => ProgrammerKind::FlashPro3,
            "FlashPro4" => ProgrammerKind::FlashPro4,
            "FlashPro5" => ProgrammerKind::FlashPro5,
            _ => ProgrammerKind::Unknown,
        }
    }
}

/// Primitive operations of a JTAG programmer.
///
/// This is the interface between the companion and the programmer hardware.
/// Implementors translate each call into whatever the vendor library or device
/// driver offers. The companion never issues two calls concurrently.
///
/// See the [`sim`] module for software implementations.
pub trait Programmer {
    /// Lists the names of all ports a programmer may be attached to.
    fn enumerate_ports(&mut self) -> Result<Vec<String>, HardwareError>;

    /// Opens the programmer on `port` and enables its programming port.
    fn open(&mut self, port: &str) -> Result<ProgrammerInfo, HardwareError>;

    /// Releases the programmer. Closing an unopened programmer is not an error.
    fn close(&mut self) -> Result<(), HardwareError>;

    /// The state of the directly attached TAP controller.
    fn state(&mut self) -> Result<TapState, HardwareError>;

    /// Moves the directly attached TAP controller to `state`.
    fn set_state(&mut self, state: TapState) -> Result<(), HardwareError>;

    /// Clocks TCK `ticks` times while staying in the current state.
    fn delay_tck(&mut self, ticks: u32) -> Result<(), HardwareError>;

    /// Waits for `microseconds` without clocking.
    fn delay_us(&mut self, microseconds: u32) -> Result<(), HardwareError>;

    /// Shifts `num_bits` bits of `output` through `register` and leaves the
    /// controller in the register's pause state.
    ///
    /// When `capture` is given it receives the bits shifted out, LSB first.
    /// `output` and `capture` hold at least `num_bits.div_ceil(8)` bytes.
    fn scan(
        &mut self,
        register: Register,
        num_bits: u32,
        output: &[u8],
        capture: Option<&mut [u8]>,
    ) -> Result<(), HardwareError>;

    /// Like [`Programmer::scan`], but shifts `num_bits` copies of `value`.
    fn scan_constant(
        &mut self,
        register: Register,
        num_bits: u32,
        value: bool,
        capture: Option<&mut [u8]>,
    ) -> Result<(), HardwareError>;

    fn set_trst(&mut self, level: PinLevel) -> Result<(), HardwareError>;

    fn trst(&mut self) -> Result<PinLevel, HardwareError>;

    /// Requests a TCK frequency. The programmer may pick the closest one it supports.
    fn set_tck_frequency(&mut self, hz: u32) -> Result<(), HardwareError>;

    /// The TCK frequency in use.
    fn tck_frequency(&mut self) -> Result<u32, HardwareError>;
}
