//! CTAPHID report layout, command vocabulary, and response serialization.
//!
//! Everything that touches raw 64-byte HID reports lives here:
//! - A validated parse step producing a tagged [`Packet`] (initial or
//!   continuation fragment) — never an in-place reinterpretation
//! - The command and error-code vocabulary shared between device and host
//! - [`ReportWriter`], which fragments one logical response into a sequence
//!   of fixed-size reports
//!
//! The engine layer (`hidmux-engine`) builds the channel and reassembly state
//! machines on top of these types.

pub mod command;
pub mod error;
pub mod packet;
pub mod writer;

pub use command::{Command, ErrorCode, KeepaliveStatus, CAPABILITY_CBOR, CAPABILITY_WINK};
pub use error::{Result, WireError};
pub use packet::{
    cont_report, init_report, Packet, BROADCAST_CHANNEL, CONT_PAYLOAD_SIZE, INIT_PAYLOAD_SIZE,
    MAX_PAYLOAD, REPORT_SIZE,
};
pub use writer::{write_error, write_keepalive, ReportSink, ReportWriter};
