/// Library crate entry point.
/// Exposes internal modules for integration tests.
/// Production binary uses src/main.rs.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod logs;
pub mod resolver;
pub mod rules;
pub mod stats;
