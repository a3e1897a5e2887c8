//! CTAPHID transport engine for FIDO2/U2F authenticators.
//!
//! hidmux multiplexes logical application channels over a single fixed-size
//! HID report pipe: fragmented inbound messages are reassembled, completed
//! messages routed to pluggable command processors, and responses fragmented
//! back out — with single-flight command processing and timeout-driven
//! channel reclamation.
//!
//! # Crate Structure
//!
//! - [`wire`] — Report layout, command vocabulary, response serialization
//! - [`engine`] — Channel registry, reassembly, dispatch, timeout sweep

/// Re-export wire types.
pub mod wire {
    pub use hidmux_wire::*;
}

/// Re-export engine types.
pub mod engine {
    pub use hidmux_engine::*;
}
