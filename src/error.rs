//! Error taxonomy shared by the transceiver, client, and both network adapters.
//!
//! Mirrors the hand-rolled `enum` + manual `Display`/`Error` shape used throughout this
//! codebase rather than reaching for a derive macro, so the error surface stays small and
//! explicit at the one place (C4/C5) that has to translate it into wire bytes or JSON.

use std::fmt;

/// Outcome of an RTU transaction as observed above C2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// No complete frame arrived before the transceiver's deadline.
    Timeout,
    /// A frame arrived but its CRC did not match.
    CrcMismatch,
    /// A frame arrived but was malformed in some other way (wrong function, truncated).
    FramingError,
    /// The slave replied with a Modbus exception; the code is preserved verbatim.
    Exception(u8),
    /// A request parameter violated a per-function limit; the bus was never touched.
    IllegalDataValue,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Timeout => write!(f, "bus timeout"),
            BusError::CrcMismatch => write!(f, "CRC mismatch"),
            BusError::FramingError => write!(f, "framing error"),
            BusError::Exception(code) => write!(f, "device exception 0x{code:02x}"),
            BusError::IllegalDataValue => write!(f, "illegal data value"),
        }
    }
}

impl std::error::Error for BusError {}
