//! Per-architecture instruction encoders.
//!
//! Both encoders are compiled on every host so their byte-exact tests run
//! everywhere; only the emitter for the host architecture is exported.

pub mod aarch64;
pub mod x86_64;
