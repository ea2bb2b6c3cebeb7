//! Core domain types for termspace
//!
//! Pure, dependency-light building blocks shared by the server:
//! session/process/layout records, the scrollback ring buffer, and the
//! command classifier. Nothing in here touches the network, the store,
//! or a PTY.

pub mod command;
pub mod error;
pub mod ring;
pub mod types;

pub use error::{Result, TermspaceError};
pub use ring::RingBuffer;
pub use types::*;
