pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod keys;
mod request_logging;
pub mod source;
pub mod supervisor;
pub mod system;
#[cfg(test)]
mod testing;
