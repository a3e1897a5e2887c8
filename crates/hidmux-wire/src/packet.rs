use crate::error::{Result, WireError};

/// Fixed physical report size in bytes.
pub const REPORT_SIZE: usize = 64;

/// Initial fragment header: channel (4) + command (1) + length (2) = 7 bytes.
pub const INIT_HEADER_SIZE: usize = 7;

/// Continuation fragment header: channel (4) + sequence (1) = 5 bytes.
pub const CONT_HEADER_SIZE: usize = 5;

/// Payload capacity of an initial fragment.
pub const INIT_PAYLOAD_SIZE: usize = REPORT_SIZE - INIT_HEADER_SIZE;

/// Payload capacity of a continuation fragment.
pub const CONT_PAYLOAD_SIZE: usize = REPORT_SIZE - CONT_HEADER_SIZE;

/// Maximum reassembled payload: one initial fragment plus 128 continuations.
pub const MAX_PAYLOAD: usize = INIT_PAYLOAD_SIZE + 128 * CONT_PAYLOAD_SIZE;

/// Reserved channel id used only for the allocation handshake.
pub const BROADCAST_CHANNEL: u32 = 0xffff_ffff;

/// High bit of the fifth report byte marking an initial fragment.
const FRAGMENT_MARKER: u8 = 0x80;

/// A parsed physical report.
///
/// Wire format:
/// ```text
/// Initial:       ┌ Channel (4B LE) ┬ Cmd|0x80 (1B) ┬ Length (2B BE) ┬ Payload (≤57B) ┐
/// Continuation:  ┌ Channel (4B LE) ┬ Sequence (1B) ┬ Payload (≤59B)                  ┐
/// ```
///
/// Payload slices borrow from the report buffer; an initial fragment's slice
/// is clamped to the declared length so callers never see padding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// First fragment of a message, announcing command and total length.
    Init {
        channel: u32,
        /// Raw command byte with the fragment marker stripped. Decoded into
        /// [`crate::Command`] only once the full message exists, so unknown
        /// codes can still be buffered and rejected with an error frame.
        command: u8,
        length: u16,
        payload: &'a [u8],
    },
    /// Follow-up fragment carrying only a sequence index.
    Cont {
        channel: u32,
        sequence: u8,
        payload: &'a [u8],
    },
}

impl<'a> Packet<'a> {
    /// Parse one physical report.
    pub fn parse(report: &'a [u8]) -> Result<Self> {
        if report.len() < CONT_HEADER_SIZE {
            return Err(WireError::TruncatedReport {
                len: report.len(),
                need: CONT_HEADER_SIZE,
            });
        }

        let channel = u32::from_le_bytes(report[0..4].try_into().expect("4-byte slice"));
        let marker = report[4];

        if marker & FRAGMENT_MARKER != 0 {
            if report.len() < INIT_HEADER_SIZE {
                return Err(WireError::TruncatedReport {
                    len: report.len(),
                    need: INIT_HEADER_SIZE,
                });
            }
            let length = u16::from_be_bytes(report[5..7].try_into().expect("2-byte slice"));
            let body = &report[INIT_HEADER_SIZE..];
            let take = body.len().min(length as usize);
            Ok(Packet::Init {
                channel,
                command: marker & !FRAGMENT_MARKER,
                length,
                payload: &body[..take],
            })
        } else {
            Ok(Packet::Cont {
                channel,
                sequence: marker,
                payload: &report[CONT_HEADER_SIZE..],
            })
        }
    }

    /// The channel id this fragment is addressed to.
    pub fn channel(&self) -> u32 {
        match self {
            Packet::Init { channel, .. } | Packet::Cont { channel, .. } => *channel,
        }
    }

    /// True for initial fragments.
    pub fn is_init(&self) -> bool {
        matches!(self, Packet::Init { .. })
    }
}

/// Encode an initial fragment. Host-side and test helper; the device emits
/// reports through [`crate::ReportWriter`] instead.
pub fn init_report(channel: u32, command: u8, length: u16, payload: &[u8]) -> [u8; REPORT_SIZE] {
    debug_assert!(payload.len() <= INIT_PAYLOAD_SIZE);
    let mut report = [0u8; REPORT_SIZE];
    report[0..4].copy_from_slice(&channel.to_le_bytes());
    report[4] = command | FRAGMENT_MARKER;
    report[5..7].copy_from_slice(&length.to_be_bytes());
    report[INIT_HEADER_SIZE..INIT_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    report
}

/// Encode a continuation fragment. Host-side and test helper.
pub fn cont_report(channel: u32, sequence: u8, payload: &[u8]) -> [u8; REPORT_SIZE] {
    debug_assert!(payload.len() <= CONT_PAYLOAD_SIZE);
    debug_assert!(sequence & FRAGMENT_MARKER == 0);
    let mut report = [0u8; REPORT_SIZE];
    report[0..4].copy_from_slice(&channel.to_le_bytes());
    report[4] = sequence;
    report[CONT_HEADER_SIZE..CONT_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    report
}
