//! Builders for constructing configurations in tests.

mod config;

pub use config::ConfigBuilder;
