//! Transport layer: framing, adaptive polling, and the connection engine.
//!
//! This module turns the raw append/read surface a driver exposes into a
//! reliable byte stream:
//!
//! - **Framing**: [`FrameType`], [`build_frame`], [`peek_header`]
//! - **Polling**: [`AdaptivePoll`] back-off between storage reads
//! - **Connections**: [`Conn`] with ordered reassembly, keep-alive,
//!   half-close, deadlines, and resource rotation
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             Application                  │
//! ├──────────────────────────────────────────┤
//! │        Connection engine (Conn)          │  ← this module
//! │   frames, reassembly, keep-alive         │
//! ├──────────────────────────────────────────┤
//! │        Security layer (Noise NN)         │
//! ├──────────────────────────────────────────┤
//! │     Storage driver (blobs, queues)       │
//! └──────────────────────────────────────────┘
//! ```

mod conn;
mod frame;
mod poll;

pub use conn::*;
pub use frame::*;
pub use poll::*;
