//! RESP wire types used by the default connection implementation.
//!
//! - [`frame`] - the `Frame` value exchanged with a node
//! - [`codec`] - incremental encoder and decoder
//! - [`error`] - the crate-wide error type

pub mod codec;
pub mod error;
pub mod frame;
