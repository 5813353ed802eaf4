pub mod cache;
pub mod config;
pub mod keys;
pub mod threading;
