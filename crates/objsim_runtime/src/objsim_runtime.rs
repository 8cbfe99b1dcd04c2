//! objsim runtime - service lifecycle and the in-process topic bus
//!
//! Every simulated object, the scenario dispatcher and the metrics recorder run
//! as services on top of this crate. The bus routes plain-text messages by
//! topic using MQTT-style filters.

pub mod service;

pub use service::*;
