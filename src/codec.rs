//! Bit-exact codecs for the formats dictated by the remote chain.

pub mod address;
pub mod binary;
