//! Software programmers.
//!
//! [`Loopback`] echoes every scan and is enough to exercise the transport end to
//! end. [`SimProgrammer`] drives a simulated TAP controller, either directly or
//! behind a simulated UJTAG bridge, and is used to check the tunnel encoding
//! bit for bit.
mod chain;
mod loopback;

pub use chain::{Device, SimProgrammer};
pub use loopback::Loopback;
