//! Session State Machines
//!
//! Three ways of using the vehicle bus share one ELM327 link:
//!
//! - [`Obd2Session`]: request/response polling of named data points
//! - [`MonitorSession`]: passive sniffing with rule-based decoding
//! - [`ControlSession`]: proprietary command macros and network wake-up
//!
//! Each climbs the same [`Rung`] ladder from a management loop and exposes
//! suspend/resume through [`ManagedSession`]. Exactly one session may own
//! the link at a time; the sessions do not enforce this themselves, the
//! [`Switchboard`] does.

mod config;
mod control;
mod error;
mod ladder;
mod lookup;
mod monitor;
mod obd2;
mod session;
mod switchboard;

pub use config::{ControlConfig, MonitorConfig, Obd2Config, SessionConfig, WakeConfig};
pub use control::{parse_macro, ControlSession, MacroStep};
pub use error::SessionError;
pub use ladder::Rung;
pub use lookup::{Lookup, StaticLookup};
pub use monitor::MonitorSession;
pub use obd2::Obd2Session;
pub use session::{ManagedSession, SessionKind};
pub use switchboard::Switchboard;
