//! Sensor Network Core Library
//!
//! Server-side model of a sensor network: nodes register over TCP, report
//! status in text lines, and are brought together into a synchronized data
//! collection run once the timing unit, a detector and GPS time are ready.

pub mod bridge;
pub mod commands;
pub mod config;
pub mod flag;
pub mod gps;
pub mod host;
pub mod nmea;
pub mod nodelog;
mod panic;
pub mod publisher;
pub mod registry;
pub mod runmgr;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;
pub mod watchbox;
pub mod wifi;
pub mod worker;

pub use commands::{CommandHandler, CommandQueue, Dispatcher, InboundLine};
pub use config::SiteConfig;
pub use flag::Flag;
pub use publisher::{Issue, Publisher};
pub use registry::SensorNet;
pub use runmgr::{ReadinessHooks, RunControl, RunManager, RunPhase};
pub use server::{Server, ServerError};
pub use session::{NodeSession, NodeSnapshot, SessionContext};
pub use types::*;
pub use watchbox::WatchBox;
pub use worker::Worker;
