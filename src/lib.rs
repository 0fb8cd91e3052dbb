//! This crate provides a client-side engine for talking to Keithley TSP and SCPI instruments, alone
//! or daisy-chained over TSP-Link.
//!
//! It is built from two layers:
//! * [`session::Session`] owns one line-oriented [`transport::Transport`] and implements the
//!   write/query dialogue, status byte polling, refractory delays, error queue draining and an
//!   emulated reply path for running without hardware.
//! * [`link::LinkCoordinator`] owns the [`node::LinkTopology`] and drives link resets, node
//!   enumeration, group assignment and per-node queue housekeeping through a session.
//!
//! Typed instrument properties are described once with an [`accessor::PropertyDescriptor`] and
//! driven by [`accessor::Property`].
//!
//! Any `embedded_io` byte stream (a serial port, a USB-serial bridge, a raw socket) can carry a
//! session through [`transport::LineTransport`]. The serial link should be configured like so:
//! * Baud rate: as set on the instrument front panel (115200 is common)
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//! * Terminator: line feed
//!
//! The crate logs through the `log` facade and never installs a logger itself.

pub mod accessor;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod link;
pub mod node;
pub mod session;
pub mod status;
pub mod transport;

#[cfg(test)]
mod mock_serial;
#[cfg(test)]
mod mock_transport;

pub use clock::{Clock, Millis, StdClock};
pub use config::SessionConfig;
pub use error::{Error, ErrorQueueEntry, ParseError, Result};
pub use link::{LinkCoordinator, LinkState};
pub use node::{LinkTopology, NodeEntity, NodeNumber};
pub use session::Session;
pub use transport::{LineTransport, Transport};
