//! Core primitives.
//!
//! The codec and hashing helpers every higher layer builds on. Nothing in
//! this module touches the network or session state.

pub mod bits;
pub mod hash;

// Re-export core types
pub use bits::{BitReader, BitWriter, CodecError};
pub use hash::{hash_with_domain, DomainHasher};
