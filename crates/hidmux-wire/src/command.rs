//! Command codes, transport error codes, and keepalive status values.
//!
//! Command bytes occupy the low 7 bits on the wire; the high bit marks an
//! initial fragment and is stripped during parsing.

/// Capability flag: device responds to the wink command.
pub const CAPABILITY_WINK: u8 = 0x01;

/// Capability flag: device accepts CBOR-encapsulated CTAP2 messages.
pub const CAPABILITY_CBOR: u8 = 0x04;

/// Transport-level commands carried by initial fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Transaction that echoes the data back.
    Ping = 0x01,
    /// Encapsulated CTAP1/U2F message.
    Msg = 0x03,
    /// Allocate a new channel id or synchronize an existing channel.
    Init = 0x06,
    /// Request visual or audible identification from the device.
    Wink = 0x08,
    /// Encapsulated CTAP2 CBOR message.
    Cbor = 0x10,
    /// Cancel the outstanding request on the given channel.
    Cancel = 0x11,
    /// The request is still being processed.
    Keepalive = 0x3b,
    /// Error response (1-byte [`ErrorCode`] body).
    Error = 0x3f,
    /// Vendor: fill a host-sized buffer from the device RNG.
    GetRng = 0x60,
    /// Vendor: diagnostic hash probe over a small CBOR map.
    Probe = 0x70,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    /// Decode a command byte (high fragment-marker bit already stripped).
    /// Unknown codes come back as `Err` carrying the raw byte so callers can
    /// report them.
    fn try_from(value: u8) -> core::result::Result<Self, u8> {
        match value {
            0x01 => Ok(Command::Ping),
            0x03 => Ok(Command::Msg),
            0x06 => Ok(Command::Init),
            0x08 => Ok(Command::Wink),
            0x10 => Ok(Command::Cbor),
            0x11 => Ok(Command::Cancel),
            0x3b => Ok(Command::Keepalive),
            0x3f => Ok(Command::Error),
            0x60 => Ok(Command::GetRng),
            0x70 => Ok(Command::Probe),
            other => Err(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        cmd as u8
    }
}

/// Error codes carried in the 1-byte body of an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// The command is not recognized.
    InvalidCommand = 0x01,
    /// The declared length is invalid for the command.
    InvalidLength = 0x03,
    /// A continuation fragment arrived out of order.
    InvalidSequence = 0x04,
    /// The channel was idle past the deadline and has been evicted.
    Timeout = 0x05,
    /// The device is occupied with another channel or command.
    ChannelBusy = 0x06,
    /// The channel id is reserved or otherwise unusable.
    InvalidChannel = 0x0b,
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        code as u8
    }
}

/// Status values carried in the 1-byte body of a keepalive frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeepaliveStatus {
    /// The device is still working on the request.
    Processing = 0x01,
    /// The device is waiting for user presence.
    UserPresenceNeeded = 0x02,
}

impl From<KeepaliveStatus> for u8 {
    fn from(status: KeepaliveStatus) -> Self {
        status as u8
    }
}
