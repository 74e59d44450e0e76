pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod flock;
pub mod index;
pub mod scheduler;
pub mod snapshot;
pub mod wal;

pub use config::{BitboxConfig, FlushPolicy, ResourceLimits};
pub use dispatch::{Dispatcher, Request, Response};
pub use engine::{Engine, EngineStats};
pub use error::{Error, ErrorKind, Result};
