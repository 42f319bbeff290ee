//! Shared primitives: errors, SQLite setup, the process-wide log registry,
//! schemas, configuration and envelope helpers.

pub mod config;
pub mod db;
pub mod error;
pub mod pool;
pub mod schemas;
pub mod time;
