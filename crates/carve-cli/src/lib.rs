//! Library half of the `carve` binary: config loading and the run/validate
//! commands, kept out of `main.rs` so they can be tested.

pub mod config;
pub mod runner;
