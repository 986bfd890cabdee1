//! Transport primitives for the HCI network layer.
//!
//! This crate provides the link binding trait used to reach the NFC
//! controller, the bit-exact HCP fragmentation/reassembly codec, and a
//! mock link for tests, without depending on any concrete transport
//! implementation.

pub mod traits;
pub mod framing;
pub mod testing;

pub use traits::*;
pub use framing::*;
pub use testing::*;
