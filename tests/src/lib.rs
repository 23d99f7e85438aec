//! Cross-crate tests.
//!
//! Fixtures are built as in-memory modules and emitted as real relocatable
//! objects, then driven through the loader, the passes, the verifier and the
//! emitter the way the CLI drives them.

pub mod fixtures;

#[cfg(test)]
mod object_roundtrip;
#[cfg(test)]
mod passes;
#[cfg(test)]
mod pipeline;
