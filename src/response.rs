//! FINS response parsing and validation.
//!
//! | Component | Size | Description |
//! |-----------|------|-------------|
//! | Header | 10 bytes | FINS header |
//! | MRC | 1 byte | Main Response Code (echoes the command) |
//! | SRC | 1 byte | Sub Response Code (echoes the command) |
//! | End code | 2 bytes | `0x0000` on success |
//! | Data | Variable | Response data (area read only) |
//!
//! The top bit of the first end-code byte flags a relay error and bits 6/7 of
//! the second byte flag CPU-unit warnings. Those bits are masked off before
//! the code is interpreted: a masked code of zero means the command itself
//! succeeded.
//!
//! # Example
//!
//! ```
//! use fins_gateway::FinsResponse;
//!
//! let bytes = [
//!     0xC0, 0x00, 0x07, 0x00, 0x01, 0x00, 0x00, 0x0A, 0x00, 0x01, // header
//!     0x01, 0x01, // MRC, SRC
//!     0x00, 0x00, // end code
//!     0x12, 0x34, 0x56, 0x78,
//! ];
//!
//! let response = FinsResponse::from_bytes(&bytes).unwrap();
//! assert!(response.check_error().is_ok());
//! assert_eq!(response.to_words(2).unwrap(), vec![0x1234, 0x5678]);
//! ```

use crate::error::{FinsError, Result};
use crate::header::{FinsHeader, FINS_HEADER_SIZE};

/// Minimum response size: header (10) + MRC + SRC + 2-byte end code = 14 bytes.
pub const MIN_RESPONSE_SIZE: usize = FINS_HEADER_SIZE + 4;

/// Relay-error bit (main code) and CPU warning bits (sub code).
const END_CODE_FLAG_MASK: u16 = 0x80C0;

/// Parsed FINS response.
#[derive(Debug, Clone)]
pub struct FinsResponse {
    /// Response header.
    pub header: FinsHeader,
    /// Main Response Code (MRC).
    pub mrc: u8,
    /// Sub Response Code (SRC).
    pub src: u8,
    /// Raw end code, flag bits included.
    pub end_code: u16,
    /// Response data (if any).
    pub data: Vec<u8>,
}

impl FinsResponse {
    /// Parses a FINS response from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `FinsError::InvalidResponse` if the reply is shorter than
    /// [`MIN_RESPONSE_SIZE`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_RESPONSE_SIZE {
            return Err(FinsError::invalid_response(format!(
                "response too short: expected at least {} bytes, got {}",
                MIN_RESPONSE_SIZE,
                data.len()
            )));
        }

        let header = FinsHeader::from_bytes(&data[..FINS_HEADER_SIZE])?;

        Ok(Self {
            header,
            mrc: data[FINS_HEADER_SIZE],
            src: data[FINS_HEADER_SIZE + 1],
            end_code: u16::from_be_bytes([data[FINS_HEADER_SIZE + 2], data[FINS_HEADER_SIZE + 3]]),
            data: data[MIN_RESPONSE_SIZE..].to_vec(),
        })
    }

    /// Serializes a response frame. Used by the simulated PLC.
    pub fn encode(header: FinsHeader, mrc: u8, src: u8, end_code: u16, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MIN_RESPONSE_SIZE + data.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.push(mrc);
        bytes.push(src);
        bytes.extend_from_slice(&end_code.to_be_bytes());
        bytes.extend_from_slice(data);
        bytes
    }

    /// End code with the relay and warning flag bits cleared.
    pub fn masked_end_code(&self) -> u16 {
        self.end_code & !END_CODE_FLAG_MASK
    }

    /// Returns whether the PLC raised a relay or CPU warning flag alongside
    /// the end code.
    pub fn has_warning_flags(&self) -> bool {
        self.end_code & END_CODE_FLAG_MASK != 0
    }

    /// Validates the end code.
    ///
    /// # Errors
    ///
    /// Returns `FinsError::Protocol` with the decoded message if the masked
    /// end code is non-zero.
    pub fn check_error(&self) -> Result<()> {
        match self.masked_end_code() {
            0 => {
                if self.has_warning_flags() {
                    tracing::warn!(
                        end_code = format_args!("0x{:04X}", self.end_code),
                        "PLC reported warning flags on a successful command"
                    );
                }
                Ok(())
            }
            code => Err(FinsError::protocol(code)),
        }
    }

    /// Validates the Service ID matches the expected value.
    ///
    /// # Errors
    ///
    /// Returns `FinsError::SidMismatch` if the SID doesn't match.
    pub fn check_sid(&self, expected: u8) -> Result<()> {
        if self.header.sid == expected {
            Ok(())
        } else {
            Err(FinsError::sid_mismatch(expected, self.header.sid))
        }
    }

    /// Slices the response data into `count` big-endian words.
    ///
    /// # Errors
    ///
    /// Returns `FinsError::InvalidResponse` if the data length does not match
    /// `count` words exactly.
    pub fn to_words(&self, count: u16) -> Result<Vec<u16>> {
        let expected = count as usize * 2;
        if self.data.len() != expected {
            return Err(FinsError::invalid_response(format!(
                "expected {} data bytes for {} words, got {}",
                expected,
                count,
                self.data.len()
            )));
        }

        Ok(self
            .data
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }
}
