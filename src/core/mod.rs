//! Core contracts shared by every layer.
//!
//! This module carries:
//! - **Constants**: wire sizes, default intervals, resource names
//! - **Errors**: the crate-wide [`Error`] taxonomy
//! - **Traits**: the [`Driver`]/[`Transport`] contracts every backend satisfies

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;
