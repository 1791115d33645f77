pub mod config;
pub mod core;
pub mod dataset;
pub mod device;
pub mod error;
pub mod kernel;
pub mod parallel;
pub mod session;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
