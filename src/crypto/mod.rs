//! Security layer: anonymous Noise handshake and data-channel sealing.

mod noise;

pub use noise::*;
