//! Error types for the BASS wire formats.

use thiserror::Error;

/// Errors raised while decoding or encoding BASS payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload ended before a fixed-size field could be read.
    #[error("Truncated {field}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// A declared length runs past the end of the payload.
    #[error("Length of {field} overruns payload: declared {declared}, {remaining} remaining")]
    LengthOverrun {
        field: &'static str,
        declared: usize,
        remaining: usize,
    },

    /// Control point opcode is unknown.
    #[error("Unknown control point opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// A field holds a value outside its allowed range.
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: u32 },

    /// Broadcast code longer than 16 octets.
    #[error("Broadcast code too long: {0} bytes (max: 16)")]
    BroadcastCodeTooLong(usize),
}

/// Reason attached to source callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ReasonCode {
    /// Operation requested by the local application.
    LocalAppRequest = 0x0000,
    /// Operation initiated by the local stack (e.g. source switch).
    LocalStackRequest = 0x0001,
    /// Change made by the sink or another assistant.
    RemoteRequest = 0x0002,
    /// Rejected by local policy.
    SystemPolicy = 0x0003,
    /// Unknown error occurred.
    Unknown = 0x0004,
    /// Request parameters are invalid.
    BadParameters = 0x0005,
    /// The sink has no free receive-state slot.
    LocalNotEnoughResources = 0x0006,
    /// The sink is already in the requested state.
    AlreadyInTargetState = 0x0007,
    /// Source id is not known on the sink.
    InvalidSourceId = 0x0008,
}

impl From<u16> for ReasonCode {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => ReasonCode::LocalAppRequest,
            0x0001 => ReasonCode::LocalStackRequest,
            0x0002 => ReasonCode::RemoteRequest,
            0x0003 => ReasonCode::SystemPolicy,
            0x0005 => ReasonCode::BadParameters,
            0x0006 => ReasonCode::LocalNotEnoughResources,
            0x0007 => ReasonCode::AlreadyInTargetState,
            0x0008 => ReasonCode::InvalidSourceId,
            _ => ReasonCode::Unknown,
        }
    }
}

impl From<ReasonCode> for u16 {
    fn from(value: ReasonCode) -> Self {
        value as u16
    }
}

impl ReasonCode {
    /// Returns true if this reason describes a successful change rather than a failure.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ReasonCode::LocalAppRequest
                | ReasonCode::LocalStackRequest
                | ReasonCode::RemoteRequest
                | ReasonCode::SystemPolicy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_round_trip() {
        for code in [
            ReasonCode::LocalAppRequest,
            ReasonCode::RemoteRequest,
            ReasonCode::BadParameters,
            ReasonCode::InvalidSourceId,
        ] {
            assert_eq!(ReasonCode::from(u16::from(code)), code);
        }
        assert_eq!(ReasonCode::from(0x1234), ReasonCode::Unknown);
    }

    #[test]
    fn test_reason_code_success() {
        assert!(ReasonCode::LocalAppRequest.is_success());
        assert!(ReasonCode::RemoteRequest.is_success());
        assert!(!ReasonCode::Unknown.is_success());
        assert!(!ReasonCode::BadParameters.is_success());
    }
}
