/// Errors from the channel registry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Every slot is occupied.
    #[error("no free channel slots")]
    NoCapacity,

    /// The channel id is not registered.
    #[error("channel {0:#010x} is not registered")]
    NotFound(u32),
}

/// Errors from the reassembly buffer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssemblyError {
    /// A message is already staged; only one may be in flight system-wide.
    #[error("reassembly already in progress for channel {0:#010x}")]
    InProgress(u32),

    /// The declared length exceeds the reassembly ceiling.
    #[error("declared length {size} exceeds maximum payload {max}")]
    Oversize { size: usize, max: usize },

    /// No message is being reassembled.
    #[error("no reassembly in progress")]
    NotBuffering,

    /// The fragment belongs to a channel that does not own the buffer.
    #[error("fragment from channel {got:#010x} while {owner:#010x} owns the buffer")]
    WrongChannel { owner: u32, got: u32 },

    /// A continuation fragment arrived with the wrong sequence number.
    #[error("continuation sequence {got} (expected {expected})")]
    BadSequence { expected: u8, got: u8 },

    /// The staged message is not complete yet.
    #[error("message is not complete")]
    NotBuffered,
}

/// Faults the engine cannot translate into a protocol error frame.
///
/// Protocol-visible failures (bad length, busy, sequence violations, …) are
/// reported to the host as error frames and never surface here; this type
/// covers the conditions the device itself cannot recover from within the
/// current operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A response could not be serialized.
    #[error("wire error: {0}")]
    Wire(#[from] hidmux_wire::WireError),

    /// A state transition that is impossible by construction happened anyway.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(&'static str),

    /// The diagnostic hash probe rejected its input. Fatal to the current
    /// command; channel and buffer state are cleaned up before returning.
    #[cfg(feature = "probe")]
    #[error("probe command failed: {0}")]
    Probe(#[from] crate::probe::ProbeError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
