//! # FlashPro JTAG Client
//!
//! A client library for driving a FlashPro JTAG programmer through a companion
//! process that holds the hardware handle.
//!
//! ## Overview
//!
//! The client keeps a single TCP connection to the companion and sends one
//! request at a time. Every call is guarded by a deadline derived from the
//! request's weight; a call that hangs terminates the process, because a request
//! stuck halfway on the wire leaves the TAP state unknown.
//!
//! - [`config`]: connection, companion and timeout settings
//! - [`session`]: connection lifecycle, companion autostart and autokill
//! - [`timeout`]: per-opcode deadlines
//! - [`watchdog`]: deadline enforcement on a background thread
//! - [`launcher`]: starting and stopping the companion process
//! - [`client`]: one method per request and a fail-fast queue executor
//!
//! For the wire format see the [`fpjtag_protocol`] crate.
//!
//! ## Basic Usage
//!
//! ### Opening a Session
//!
//! ```ignore
//! use fpjtag_client::{client::Client, config::Builder};
//!
//! let config = Builder::new().autostart(true).autokill(true).build();
//! let mut client = Client::new(config)?;
//! let (code_version, api_version) = client.open()?;
//! ```
//!
//! ### Running a Queue
//!
//! ```ignore
//! use fpjtag_protocol::{Operation, ScanCommand, ScanField};
//! use fpjtag_protocol::tap::{Register, TapState};
//!
//! let mut queue = vec![
//!     Operation::StateMove { end_state: TapState::Idle },
//!     Operation::Scan(ScanCommand {
//!         register: Register::Data,
//!         end_state: TapState::Idle,
//!         fields: vec![ScanField::capture(32)],
//!     }),
//! ];
//! client.execute_queue(&mut queue)?;
//! ```
//!
//! ## Error Handling
//!
//! A non-zero status from the companion is returned as
//! [`error::ClientError::Status`] and leaves the session usable. Transport errors
//! are fatal: with [`config::Config::fail_stop`] the process exits, otherwise the
//! error is returned.
pub mod client;
pub mod config;
pub mod error;
pub mod launcher;
pub mod session;
pub mod timeout;
pub mod watchdog;
