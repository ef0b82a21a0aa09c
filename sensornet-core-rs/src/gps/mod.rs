//! GPS receiver on the central timing unit
//!
//! `records` parses the sentences the receiver emits, `module` keeps the
//! server's model of the receiver and sends it commands, and `manager`
//! drives the receiver from power-on to trustworthy timing.

pub mod manager;
pub mod module;
pub mod records;

pub use manager::{GpsControl, GpsManager, ModuleControl, ACQUISITION_LADDER};
pub use module::{GpsEvent, GpsModule, GpsSnapshot, HostLink, RestartKind};
pub use records::{GpsParseError, TraimRecord, TraimStatus};
