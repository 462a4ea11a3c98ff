pub mod config;
mod error;
pub mod extract;
pub mod http;
pub mod invocation;
pub mod logging;
pub mod paths;
pub mod recognition;
pub mod staging;
pub mod storage;
#[cfg(test)]
mod test_server;

pub use error::{EngineError, Result};
