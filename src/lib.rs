// ABOUTME: Library module for parallel-dumper
// ABOUTME: Exports the dump engine for use in the binary and tests

pub mod barrier;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod context;
pub mod dump;
pub mod error;
pub mod filters;
pub mod jobs;
pub mod mysql;
pub mod pipeline;
pub mod sink;
pub mod utils;
pub mod worker;
pub mod writer;

pub use config::DumpOptions;
pub use context::DumpControl;
pub use dump::{run_dump, DumpReport, TableSummary};
