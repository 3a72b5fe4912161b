//! TCP file transfer over a length-prefixed, magic-tagged binary protocol.
//!
//! This module provides:
//! - Wire primitives (big-endian integers, length-prefixed strings, digests)
//! - The single, multi-file and resumable sub-protocols, both directions
//! - A one-connection-at-a-time server
//! - A retrying client with cooperative pause

pub mod client;
pub mod codec;
pub mod constants;
pub mod hash;
pub mod partial;
pub mod pause;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod utils;

// Re-export public API
pub use client::{BatchReport, RetryPolicy, SendReport, TransferClient};
pub use constants::TRANSFER_PORT;
pub use pause::PauseSignal;
pub use progress::{NoProgress, ProgressReporter};
pub use receiver::{ReceiveOutcome, ReceivedFile, receive_connection};
pub use server::{ServerHandle, TransferServer};
