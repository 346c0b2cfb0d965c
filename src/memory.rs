//! Memory area definitions for the FINS protocol.
//!
//! The gateway only talks to the DM (Data Memory) area family: every slot and
//! handshake flag lives there. The enum is kept open so an area can be added
//! without touching the command builders.

use serde::Serialize;

/// Memory areas addressable by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[non_exhaustive]
pub enum MemoryArea {
    /// DM (Data Memory) area - word-only data storage.
    DM,
}

impl MemoryArea {
    /// Returns the FINS code for word access to this memory area.
    pub(crate) fn word_code(self) -> u8 {
        match self {
            MemoryArea::DM => 0x82,
        }
    }

    /// Maps a word-access area code back to the area.
    pub(crate) fn from_word_code(code: u8) -> Option<Self> {
        match code {
            0x82 => Some(MemoryArea::DM),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryArea::DM => write!(f, "DM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_code() {
        assert_eq!(MemoryArea::DM.word_code(), 0x82);
        assert_eq!(MemoryArea::from_word_code(0x82), Some(MemoryArea::DM));
        assert_eq!(MemoryArea::from_word_code(0xB0), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(MemoryArea::DM.to_string(), "DM");
    }
}
