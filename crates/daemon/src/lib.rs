pub mod config;
pub mod fuse;

pub use config::{Config, ConfigError, DispatcherConfig};
pub use fuse::{Dispatcher, Session};
