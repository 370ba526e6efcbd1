pub mod config;
pub mod diff;
pub mod redis;
pub mod types;
