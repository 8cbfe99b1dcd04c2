//! objsim - simulated networked devices on a topic bus
//!
//! This crate provides:
//! - Topic addressing shared by devices and publishers (`address`)
//! - The `change`/`request` payload grammar (`protocol`)
//! - Per-device configuration and field registry (`registry`)
//! - Lamp, smoke detector and system metric devices (`device`)
//! - The scenario dispatcher and scenario records (`dispatcher`, `scenario`)
//! - Document and time-series storage with memory and redb backends (`store`)
//! - A recorder feeding device metrics into the time-series store (`recorder`)
//!
//! Services run on `objsim_runtime`, which owns the in-process bus.

pub use objsim_runtime;

pub mod address;
pub mod app;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod protocol;
pub mod recorder;
pub mod registry;
pub mod scenario;
pub mod store;
pub mod types;

pub use address::{Identity, TargetPattern, WILDCARD};
pub use config::SimConfig;
pub use device::{Device, DeviceKind, DeviceRuntime};
pub use dispatcher::ScenarioDispatcher;
pub use recorder::MetricsRecorder;
pub use types::{Error, Result, Value};
