//! # FlashPro JTAG Protocol Library
//!
//! This crate holds everything a client and a companion process have to agree on
//! when driving a FlashPro JTAG programmer through an out-of-process transport:
//! the TAP controller model, the operation model and the binary wire format.
//!
//! ## Overview
//!
//! - [`tap`]: the IEEE 1149.1 TAP state machine and the TMS path planner
//! - [`protocol`]: opcodes, JTAG operations, requests and responses
//! - [`codec`]: framed binary encoding of requests and responses
//! - [`framing`]: a `tokio-util` codec for the companion side (feature `tokio`)
//!
//! ## Basic Usage
//!
//! ### Planning TMS paths
//!
//! ```
//! use fpjtag_protocol::tap::{tms_path, TapState};
//!
//! let path = tms_path(TapState::Idle, TapState::DrShift).unwrap();
//! assert_eq!(path.len(), 3);
//! assert_eq!(path.walk(TapState::Idle).unwrap(), TapState::DrShift);
//! ```
//!
//! ### Writing a request
//!
//! ```
//! use fpjtag_protocol::{Operation, Request};
//! use fpjtag_protocol::tap::TapState;
//!
//! let request = Request::Execute(Operation::StateMove { end_state: TapState::Idle });
//! let mut buffer = Vec::new();
//! request.write_to(&mut buffer).expect("Writing to vector shouldn't fail");
//! assert_eq!(buffer, b"\x07\x00\x00\x00\x20\x09\x61\x01\x00\x00\x00");
//! ```
//!
//! ### Reading a response
//!
//! ```
//! use fpjtag_protocol::{Opcode, Response};
//! use fpjtag_protocol::codec::MAX_FRAME_SIZE;
//! use std::io::Cursor;
//!
//! let mut reader = Cursor::new(b"\x0a\x00\x00\x00\x61\x00\x00\x00\x00\x61\x70\x17\x00\x00");
//! let response = Response::from_reader(&mut reader, Opcode::SetSpeedDivisor, MAX_FRAME_SIZE)
//!     .expect("Response should parse");
//! assert_eq!(response, Response::SpeedDivisor { khz: 6000 });
//! ```
//!
//! ## Message Format
//!
//! Every envelope is a little-endian `u32` length followed by a payload of
//! tagged fields. Requests start with their opcode, responses with an `i32`
//! status. A response whose status is not zero carries no further fields.
//!
//! ## Error Handling
//!
//! Decoding errors are reported as [`error::ReadError`]; path planning errors as
//! [`error::TapError`].
//!
//! ## Thread Safety
//!
//! The types in this library are thread-safe and can be safely shared across threads.
//! However, I/O operations (reading/writing) are not synchronized and require external coordination.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
#[cfg(feature = "tokio")]
pub mod framing;
pub mod tap;
