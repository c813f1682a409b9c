//! Built-in storage drivers.
//!
//! Each driver adapts one backend to the rendezvous and transport contracts:
//!
//! - [`memory`]: shared in-process services, for tests and demos
//! - [`fs`]: append-only files in a shared directory, for cross-process use
//!
//! External backends plug in through [`crate::register_factory`].

pub mod fs;
pub mod memory;
