pub mod backup;
pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod health;
pub mod io;
pub mod lock;
pub mod maintenance;
pub mod orchestrator;
pub mod paths;
pub mod prereq;
pub mod process;
pub mod progress;
pub mod repo;
pub mod service;

#[cfg(test)]
mod testing;

pub use error::{Result, UpkeepError};
