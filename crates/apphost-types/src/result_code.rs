//! Result codes returned by the daemon after every control sequence.

use std::fmt;

/// One-byte status read right after a register, query or resolve request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    Rejected,
    Failed,
    Timeout,
    AlreadyRegistered,
    Unexpected,
    /// A code outside the known table. Kept so it can still be reported.
    Unknown(u8),
}

impl ResultCode {
    pub const SUCCESS: u8 = 0x00;
    pub const REJECTED: u8 = 0x01;
    pub const FAILED: u8 = 0x02;
    pub const TIMEOUT: u8 = 0x03;
    pub const ALREADY_REGISTERED: u8 = 0x04;
    pub const UNEXPECTED: u8 = 0xff;

    /// Decode a wire byte. Never fails: unknown values become [`ResultCode::Unknown`].
    pub fn from_byte(code: u8) -> Self {
        match code {
            Self::SUCCESS => ResultCode::Success,
            Self::REJECTED => ResultCode::Rejected,
            Self::FAILED => ResultCode::Failed,
            Self::TIMEOUT => ResultCode::Timeout,
            Self::ALREADY_REGISTERED => ResultCode::AlreadyRegistered,
            Self::UNEXPECTED => ResultCode::Unexpected,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            ResultCode::Success => Self::SUCCESS,
            ResultCode::Rejected => Self::REJECTED,
            ResultCode::Failed => Self::FAILED,
            ResultCode::Timeout => Self::TIMEOUT,
            ResultCode::AlreadyRegistered => Self::ALREADY_REGISTERED,
            ResultCode::Unexpected => Self::UNEXPECTED,
            ResultCode::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Success => f.write_str("Success"),
            // register
            ResultCode::AlreadyRegistered => f.write_str("Port already registered"),
            ResultCode::Failed => f.write_str("Registering port failed"),
            // query, resolve
            ResultCode::Rejected => f.write_str("Query rejected"),
            ResultCode::Timeout => f.write_str("Query timeout"),
            ResultCode::Unexpected => f.write_str("Query unexpected error"),
            ResultCode::Unknown(code) => write!(f, "Unknown error code {code}"),
        }
    }
}
