/// Errors that can occur at the report layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The report is shorter than the smallest valid fragment header.
    #[error("truncated report ({len} bytes, need at least {need})")]
    TruncatedReport { len: usize, need: usize },

    /// The response exceeds the maximum reassembled payload size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, WireError>;
