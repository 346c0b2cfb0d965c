//! Error types for the FINS protocol layer.
//!
//! [`FinsError`] covers everything that can go wrong between building a frame
//! and getting words back from the PLC: transport failures, malformed replies,
//! and non-zero end codes reported by the PLC itself.

use std::io;
use thiserror::Error;

/// Result type alias for FINS operations.
pub type Result<T> = std::result::Result<T, FinsError>;

/// Errors that can occur during FINS communication.
#[derive(Debug, Error)]
pub enum FinsError {
    /// The PLC answered with a non-zero end code.
    #[error("PLC error 0x{code:04X}: {message}")]
    Protocol {
        /// End code with the relay/non-fatal flag bits masked off.
        code: u16,
        /// Human-readable description from the end-code table.
        message: String,
    },

    /// Invalid parameter provided.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// Invalid response received from PLC.
    #[error("Invalid response: {reason}")]
    InvalidResponse {
        /// Description of the response error.
        reason: String,
    },

    /// No reply arrived before the transport timeout expired.
    #[error("Communication timeout")]
    Timeout,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Service ID mismatch between request and response.
    #[error("SID mismatch: expected 0x{expected:02X}, received 0x{received:02X}")]
    SidMismatch {
        /// Expected SID value.
        expected: u8,
        /// Received SID value.
        received: u8,
    },
}

impl FinsError {
    /// Creates a `Protocol` error, looking the message up in the end-code table.
    pub fn protocol(code: u16) -> Self {
        Self::Protocol {
            code,
            message: end_code_message(code),
        }
    }

    /// Creates a new `InvalidParameter` error.
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidResponse` error.
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Creates a new `SidMismatch` error.
    pub fn sid_mismatch(expected: u8, received: u8) -> Self {
        Self::SidMismatch { expected, received }
    }

    /// Returns whether the error is a transport timeout.
    ///
    /// Handshake flag access retries on this kind only.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// End codes and their descriptions.
///
/// Grouped by main code: local node, destination node, controller, service,
/// routing, command format, parameter, read-only, mode, environment, access.
const END_CODES: &[(u16, &str)] = &[
    (0x0001, "service canceled"),
    (0x0101, "local node not in network"),
    (0x0102, "token timeout"),
    (0x0103, "retries failed"),
    (0x0104, "too many send frames"),
    (0x0105, "node address range error"),
    (0x0106, "node address duplication"),
    (0x0201, "destination node not in network"),
    (0x0202, "unit missing"),
    (0x0203, "third node missing"),
    (0x0204, "destination node busy"),
    (0x0205, "response timeout"),
    (0x0301, "communications controller error"),
    (0x0302, "CPU unit error"),
    (0x0303, "controller error"),
    (0x0304, "unit number error"),
    (0x0401, "undefined command"),
    (0x0402, "not supported by model/version"),
    (0x0501, "destination address setting error"),
    (0x0502, "no routing tables"),
    (0x0503, "routing table error"),
    (0x0504, "too many relays"),
    (0x1001, "command too long"),
    (0x1002, "command too short"),
    (0x1003, "elements/data don't match"),
    (0x1004, "command format error"),
    (0x1005, "header error"),
    (0x1101, "area classification missing"),
    (0x1102, "access size error"),
    (0x1103, "address range error"),
    (0x1104, "address range exceeded"),
    (0x1106, "program missing"),
    (0x1109, "relational error"),
    (0x110A, "duplicate data access"),
    (0x110B, "response too long"),
    (0x110C, "parameter error"),
    (0x2002, "protected"),
    (0x2101, "read-only"),
    (0x2102, "write protected"),
    (0x2201, "not possible in current operating mode"),
    (0x2202, "not possible while running"),
    (0x2301, "file device missing"),
    (0x2302, "memory missing"),
    (0x2502, "memory error"),
    (0x3001, "no access right"),
    (0x4001, "service aborted"),
];

/// Returns the description for an end code.
///
/// Unknown codes produce `"unknown error 0xNNNN"`.
///
/// # Example
///
/// ```
/// use fins_gateway::fins_error_description;
///
/// assert_eq!(fins_error_description(0x1103), "address range error");
/// assert_eq!(fins_error_description(0x7777), "unknown error 0x7777");
/// ```
pub fn fins_error_description(code: u16) -> String {
    end_code_message(code)
}

fn end_code_message(code: u16) -> String {
    END_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, message)| (*message).to_string())
        .unwrap_or_else(|| format!("unknown error 0x{code:04X}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = FinsError::protocol(0x1103);
        assert_eq!(err.to_string(), "PLC error 0x1103: address range error");
    }

    #[test]
    fn test_unknown_end_code() {
        let err = FinsError::protocol(0xABCD);
        assert_eq!(err.to_string(), "PLC error 0xABCD: unknown error 0xABCD");
    }

    #[test]
    fn test_end_code_table_is_unique() {
        for (i, (code, _)) in END_CODES.iter().enumerate() {
            assert!(
                END_CODES[i + 1..].iter().all(|(other, _)| other != code),
                "duplicate end code 0x{code:04X}"
            );
        }
    }

    #[test]
    fn test_timeout_display() {
        let err = FinsError::Timeout;
        assert_eq!(err.to_string(), "Communication timeout");
        assert!(err.is_timeout());
        assert!(!FinsError::protocol(0x0205).is_timeout());
    }

    #[test]
    fn test_sid_mismatch_display() {
        let err = FinsError::sid_mismatch(0x01, 0x02);
        assert_eq!(
            err.to_string(),
            "SID mismatch: expected 0x01, received 0x02"
        );
    }
}
