#![forbid(unsafe_code)]

pub mod admin;
pub mod config;
pub mod error;
pub mod exec;
pub mod lang;
mod paths;
pub mod proto;
pub mod sched;
pub mod server;
pub mod service;
pub mod stats;
pub mod telemetry;

pub use config::Config;
pub use error::Error;
pub use service::{Service, ServiceHandle};

pub type Result<T> = std::result::Result<T, Error>;
