//! Stream bridge
//!
//! Decouples device polling from consumers:
//!
//! 1. [`worker`] - the poll loop, run on a dedicated blocking thread
//! 2. [`stream_bridge`] - lifecycle, readiness handshake and chunked reads
//!
//! # Architecture
//!
//! ```text
//!  foreground                          worker thread
//!  ──────────                          ─────────────
//!  start() ──spawn──────────────────► open device + outlet
//!          ◄──────ready (oneshot)────
//!  resolve inlet                       loop { poll() } until shutdown
//!  read()  ◄──────samples (stream)───
//!  stop()  ──shutdown (token)───────► close device
//!          ◄──────join───────────────
//! ```

pub mod error;
pub mod stream_bridge;
pub mod worker;

pub use error::BridgeError;
pub use stream_bridge::{BridgeSettings, BridgeState, StreamBridge};
pub use worker::{WorkerExit, WorkerReport};
