//! Channel registry, message reassembly, and command dispatch for CTAPHID
//! transports.
//!
//! This is the core value-add layer of hidmux. One [`Engine`] multiplexes
//! logical channels over a single 64-byte HID report pipe:
//! - [`ChannelRegistry`] tracks the small set of active channels
//! - [`Assembler`] accumulates one fragmented inbound message at a time
//! - [`Engine`] classifies each report, reassembles, and routes complete
//!   messages to the [`Platform`] collaborators
//!
//! Single-threaded and run-to-completion: each report is processed fully
//! before the next, and the timeout sweep runs between reports — never
//! concurrently with one.

pub mod assembly;
pub mod dispatch;
pub mod error;
pub mod platform;
#[cfg(feature = "probe")]
pub mod probe;
pub mod registry;

pub use assembly::{Assembler, AssemblyStatus, Message};
pub use dispatch::{Engine, EngineConfig};
pub use error::{AssemblyError, EngineError, RegistryError, Result};
pub use platform::{CborReply, Platform};
#[cfg(feature = "probe")]
pub use probe::{ProbeError, MAX_PROBE_DATA};
pub use registry::{ChannelRegistry, CHANNEL_SLOTS};
