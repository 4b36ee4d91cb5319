//! Native build engine.
//!
//! The `engine` binary and the `native_engine` Python module are thin layers
//! over [`engine::Engine`]. The module is only compiled with the `python`
//! feature, so the default build and its tests never link against libpython.

pub mod config;
pub mod engine;
pub mod entry_point;
pub mod nail;
pub mod telemetry;

#[cfg(feature = "python")]
mod interface;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError, Remotes};
