//! Architecture-neutral emission API, realized once per backend.
//!
//! Both realizations compile on every host so their expansion tests run
//! everywhere; `Emitter` names the one matching the build target.

pub mod aarch64;
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::Emitter;
#[cfg(target_arch = "x86_64")]
pub use x86_64::Emitter;
