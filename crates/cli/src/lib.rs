//! Command-line front end of the shroud obfuscator.

pub mod commands;
