//! Shared error taxonomy for the shroud workspace.

pub mod errors;
