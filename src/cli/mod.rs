//! Command-line interface

pub mod commands;

pub use commands::{build_source, Engine, TraceOverrides};
