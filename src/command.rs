//! FINS command structures and serialization.
//!
//! Only the two memory-area commands the gateway needs are implemented:
//!
//! - [`ReadWordCommand`] - area read (MRC 0x01, SRC 0x01)
//! - [`WriteWordCommand`] - area write (MRC 0x01, SRC 0x02)
//!
//! Both share the body layout
//! `[MRC, SRC, area, addr_hi, addr_lo, bit=0, count_hi, count_lo]`; the write
//! command appends `count` big-endian words.
//!
//! [`AreaRequest::parse`] decodes such a frame again, which is what the
//! [`SimulatedPlc`](crate::SimulatedPlc) uses to answer requests.
//!
//! # Example
//!
//! ```
//! use fins_gateway::{MemoryArea, NodeAddress, ReadWordCommand};
//!
//! let cmd = ReadWordCommand::new(
//!     NodeAddress::new(0, 10, 0),
//!     NodeAddress::new(0, 1, 0),
//!     0x01,
//!     MemoryArea::DM,
//!     100,
//!     10,
//! ).unwrap();
//! assert_eq!(cmd.to_bytes().len(), 18);
//! ```

use crate::error::{FinsError, Result};
use crate::header::{FinsHeader, NodeAddress, FINS_HEADER_SIZE};
use crate::memory::MemoryArea;

/// Memory area command code (MRC).
pub(crate) const MRC_MEMORY_AREA: u8 = 0x01;
/// Memory area read sub-code (SRC).
pub(crate) const SRC_MEMORY_READ: u8 = 0x01;
/// Memory area write sub-code (SRC).
pub(crate) const SRC_MEMORY_WRITE: u8 = 0x02;

/// Size of the area-read/area-write body before any data words.
const AREA_BODY_SIZE: usize = 8;

/// Maximum number of words that can be read/written in a single command.
pub const MAX_WORDS_PER_COMMAND: u16 = 999;

fn check_count(parameter: &str, count: usize) -> Result<()> {
    if count == 0 {
        return Err(FinsError::invalid_parameter(
            parameter,
            "must be greater than 0",
        ));
    }
    if count > MAX_WORDS_PER_COMMAND as usize {
        return Err(FinsError::invalid_parameter(
            parameter,
            format!("must not exceed {} words", MAX_WORDS_PER_COMMAND),
        ));
    }
    Ok(())
}

fn push_area_body(bytes: &mut Vec<u8>, src: u8, area: MemoryArea, address: u16, count: u16) {
    bytes.push(MRC_MEMORY_AREA);
    bytes.push(src);
    bytes.push(area.word_code());
    bytes.extend_from_slice(&address.to_be_bytes());
    bytes.push(0x00); // bit offset, always 0 for word access
    bytes.extend_from_slice(&count.to_be_bytes());
}

/// Command for reading words from PLC memory.
#[derive(Debug, Clone)]
pub struct ReadWordCommand {
    header: FinsHeader,
    area: MemoryArea,
    address: u16,
    count: u16,
}

impl ReadWordCommand {
    /// Creates a new read word command.
    ///
    /// # Errors
    ///
    /// Returns an error if count is 0 or exceeds [`MAX_WORDS_PER_COMMAND`].
    pub fn new(
        destination: NodeAddress,
        source: NodeAddress,
        sid: u8,
        area: MemoryArea,
        address: u16,
        count: u16,
    ) -> Result<Self> {
        check_count("count", count as usize)?;

        Ok(Self {
            header: FinsHeader::new_command(destination, source, sid),
            area,
            address,
            count,
        })
    }

    /// Returns the service ID.
    pub fn sid(&self) -> u8 {
        self.header.sid
    }

    /// Serializes the command to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FINS_HEADER_SIZE + AREA_BODY_SIZE);
        bytes.extend_from_slice(&self.header.to_bytes());
        push_area_body(&mut bytes, SRC_MEMORY_READ, self.area, self.address, self.count);
        bytes
    }
}

/// Command for writing words to PLC memory.
#[derive(Debug, Clone)]
pub struct WriteWordCommand {
    header: FinsHeader,
    area: MemoryArea,
    address: u16,
    data: Vec<u16>,
}

impl WriteWordCommand {
    /// Creates a new write word command.
    ///
    /// # Errors
    ///
    /// Returns an error if data is empty or exceeds [`MAX_WORDS_PER_COMMAND`].
    pub fn new(
        destination: NodeAddress,
        source: NodeAddress,
        sid: u8,
        area: MemoryArea,
        address: u16,
        data: &[u16],
    ) -> Result<Self> {
        check_count("data", data.len())?;

        Ok(Self {
            header: FinsHeader::new_command(destination, source, sid),
            area,
            address,
            data: data.to_vec(),
        })
    }

    /// Returns the service ID.
    pub fn sid(&self) -> u8 {
        self.header.sid
    }

    /// Serializes the command to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(FINS_HEADER_SIZE + AREA_BODY_SIZE + self.data.len() * 2);
        bytes.extend_from_slice(&self.header.to_bytes());
        push_area_body(
            &mut bytes,
            SRC_MEMORY_WRITE,
            self.area,
            self.address,
            self.data.len() as u16,
        );
        for word in &self.data {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes
    }
}

/// A decoded area-read or area-write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AreaRequest {
    /// Area read of `count` words starting at `address`.
    Read {
        /// Target area.
        area: MemoryArea,
        /// First word address.
        address: u16,
        /// Number of words.
        count: u16,
    },
    /// Area write of `data` starting at `address`.
    Write {
        /// Target area.
        area: MemoryArea,
        /// First word address.
        address: u16,
        /// Words to store.
        data: Vec<u16>,
    },
}

impl AreaRequest {
    /// Parses a command frame into its header and request.
    ///
    /// # Errors
    ///
    /// Returns `FinsError::InvalidParameter` for frames that are truncated,
    /// use an unsupported command or area, or whose data does not match the
    /// declared word count.
    pub fn parse(frame: &[u8]) -> Result<(FinsHeader, AreaRequest)> {
        let header = FinsHeader::from_bytes(frame)?;
        let body = &frame[FINS_HEADER_SIZE..];
        if body.len() < AREA_BODY_SIZE {
            return Err(FinsError::invalid_parameter(
                "frame",
                format!("command body too short: {} bytes", body.len()),
            ));
        }
        if body[0] != MRC_MEMORY_AREA {
            return Err(FinsError::invalid_parameter(
                "mrc",
                format!("unsupported command 0x{:02X}{:02X}", body[0], body[1]),
            ));
        }
        let area = MemoryArea::from_word_code(body[2]).ok_or_else(|| {
            FinsError::invalid_parameter("area", format!("unsupported area code 0x{:02X}", body[2]))
        })?;
        let address = u16::from_be_bytes([body[3], body[4]]);
        let count = u16::from_be_bytes([body[6], body[7]]);
        check_count("count", count as usize)?;

        let request = match body[1] {
            SRC_MEMORY_READ => AreaRequest::Read {
                area,
                address,
                count,
            },
            SRC_MEMORY_WRITE => {
                let payload = &body[AREA_BODY_SIZE..];
                if payload.len() != count as usize * 2 {
                    return Err(FinsError::invalid_parameter(
                        "data",
                        format!(
                            "expected {} data bytes for {} words, got {}",
                            count as usize * 2,
                            count,
                            payload.len()
                        ),
                    ));
                }
                let data = payload
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect();
                AreaRequest::Write {
                    area,
                    address,
                    data,
                }
            }
            other => {
                return Err(FinsError::invalid_parameter(
                    "src",
                    format!("unsupported sub-command 0x{other:02X}"),
                ))
            }
        };

        Ok((header, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plc() -> NodeAddress {
        NodeAddress::new(0, 10, 0)
    }

    fn gateway() -> NodeAddress {
        NodeAddress::new(0, 1, 0)
    }

    #[test]
    fn test_read_frame_layout() {
        let cmd = ReadWordCommand::new(plc(), gateway(), 0x05, MemoryArea::DM, 3000, 47).unwrap();
        assert_eq!(cmd.sid(), 0x05);
        assert_eq!(
            cmd.to_bytes(),
            hex::decode("800007000a0000010005 010182 0bb8 00 002f".replace(' ', "")).unwrap()
        );
    }

    #[test]
    fn test_write_frame_layout() {
        let cmd =
            WriteWordCommand::new(plc(), gateway(), 0x06, MemoryArea::DM, 4000, &[0x0000, 0x1234])
                .unwrap();
        assert_eq!(
            cmd.to_bytes(),
            hex::decode("800007000a0000010006 010282 0fa0 00 0002 0000 1234".replace(' ', ""))
                .unwrap()
        );
    }

    #[test]
    fn test_count_bounds() {
        assert!(ReadWordCommand::new(plc(), gateway(), 0, MemoryArea::DM, 0, 0).is_err());
        assert!(ReadWordCommand::new(plc(), gateway(), 0, MemoryArea::DM, 0, 1000).is_err());
        assert!(ReadWordCommand::new(plc(), gateway(), 0, MemoryArea::DM, 0, 999).is_ok());
        assert!(WriteWordCommand::new(plc(), gateway(), 0, MemoryArea::DM, 0, &[]).is_err());
    }

    #[test]
    fn test_parse_write_request() {
        let cmd =
            WriteWordCommand::new(plc(), gateway(), 0x09, MemoryArea::DM, 1015, &[0x0042]).unwrap();
        let (header, request) = AreaRequest::parse(&cmd.to_bytes()).unwrap();

        assert_eq!(header.sid, 0x09);
        assert_eq!(
            request,
            AreaRequest::Write {
                area: MemoryArea::DM,
                address: 1015,
                data: vec![0x0042],
            }
        );
    }

    #[test]
    fn test_parse_rejects_short_write_payload() {
        let mut bytes = WriteWordCommand::new(plc(), gateway(), 1, MemoryArea::DM, 0, &[1, 2])
            .unwrap()
            .to_bytes();
        bytes.pop();
        assert!(AreaRequest::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_area() {
        let mut bytes = ReadWordCommand::new(plc(), gateway(), 1, MemoryArea::DM, 0, 1)
            .unwrap()
            .to_bytes();
        bytes[FINS_HEADER_SIZE + 2] = 0xB0;
        assert!(AreaRequest::parse(&bytes).is_err());
    }
}
