//! The per-printer communication engine: serial adapter, line reader, G-code
//! protocol codec, command sequencer, and the state machine that ties them
//! together into a reconnecting, request/reply printer connection.
//!
//! This crate knows nothing about print jobs, the HTTP surface, or device
//! discovery — it only ships individual commands to one printer at a time
//! and reports their replies.

pub mod adapter;
pub mod codec;
pub mod engine;
pub mod error;
mod link;
pub mod sequencer;
pub mod settings;

pub use engine::{Engine, ListenerId, PrinterState, StateListener};
pub use error::{Error, SendError};
pub use settings::{PrintArea, PrinterSettings};
