//! glomers core library
//!
//! This crate provides the wire types, error codes, and key placement shared
//! by every glomers node.
//!
//! # Modules
//!
//! - [`types`]: Message envelope and the closed payload enum
//! - [`placement`]: Static single-primary-per-key assignment
//! - [`error`]: Error types and wire error codes

pub mod error;
pub mod placement;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, ErrorCode, Result};
pub use placement::Placement;
pub use types::*;
