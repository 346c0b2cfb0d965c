//! In-process PLC simulator.
//!
//! [`SimulatedPlc`] implements [`Transport`] by decoding each FINS frame,
//! applying it to an in-memory DM area and encoding a genuine FINS reply, so
//! everything above the transport runs unchanged against it. It is used by
//! the test-suite and by the `plc.simulate` configuration switch for dry
//! runs without hardware.
//!
//! Faults can be injected: writes into an address range can be answered
//! with a chosen end code, and the next N exchanges can time out.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::command::{AreaRequest, MRC_MEMORY_AREA, SRC_MEMORY_READ, SRC_MEMORY_WRITE};
use crate::error::{FinsError, Result};
use crate::header::FinsHeader;
use crate::response::FinsResponse;
use crate::transport::Transport;

const END_OK: u16 = 0x0000;
const END_FORMAT_ERROR: u16 = 0x1004;
const END_RANGE_EXCEEDED: u16 = 0x1104;

#[derive(Debug, Default)]
struct PlcState {
    memory: HashMap<u16, u16>,
    rejected_writes: Vec<(Range<u16>, u16)>,
    pending_timeouts: u32,
    exchanges: usize,
    write_log: Vec<(u16, usize)>,
}

/// Cloneable handle to a simulated PLC; clones share the same memory.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPlc {
    state: Arc<Mutex<PlcState>>,
}

fn overlaps(a: &Range<u16>, start: u16, len: usize) -> bool {
    let end = start as usize + len;
    (a.start as usize) < end && start < a.end
}

impl SimulatedPlc {
    /// Creates a PLC with all DM words at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns one DM word.
    pub fn word(&self, address: u16) -> u16 {
        self.state.lock().memory.get(&address).copied().unwrap_or(0)
    }

    /// Returns `count` consecutive DM words.
    pub fn words(&self, address: u16, count: u16) -> Vec<u16> {
        let state = self.state.lock();
        (0..count)
            .map(|i| {
                state
                    .memory
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Sets one DM word, as the PLC program would.
    pub fn set_word(&self, address: u16, value: u16) {
        self.state.lock().memory.insert(address, value);
    }

    /// Sets consecutive DM words starting at `address`.
    pub fn set_words(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (i, value) in values.iter().enumerate() {
            state.memory.insert(address.wrapping_add(i as u16), *value);
        }
    }

    /// Fills `range` with `0xFFFF`, i.e. memory the PLC never initialised.
    pub fn fill_uninitialized(&self, range: Range<u16>) {
        let mut state = self.state.lock();
        for address in range {
            state.memory.insert(address, 0xFFFF);
        }
    }

    /// Answers every write touching `range` with `end_code` and leaves memory untouched.
    pub fn reject_writes(&self, range: Range<u16>, end_code: u16) {
        self.state.lock().rejected_writes.push((range, end_code));
    }

    /// Removes every write rejection.
    pub fn clear_rejections(&self) {
        self.state.lock().rejected_writes.clear();
    }

    /// Makes the next `count` exchanges fail with [`FinsError::Timeout`].
    pub fn time_out_next(&self, count: u32) {
        self.state.lock().pending_timeouts = count;
    }

    /// Number of exchanges handled so far, timed-out ones included.
    pub fn exchanges(&self) -> usize {
        self.state.lock().exchanges
    }

    /// Number of accepted writes whose span overlaps `range`.
    pub fn writes_into(&self, range: Range<u16>) -> usize {
        self.state
            .lock()
            .write_log
            .iter()
            .filter(|(address, len)| overlaps(&range, *address, *len))
            .count()
    }

    fn handle(&self, header: FinsHeader, request: AreaRequest) -> Vec<u8> {
        let reply_header = FinsHeader::response_to(&header);
        let mut state = self.state.lock();

        match request {
            AreaRequest::Read { address, count, .. } => {
                if address as usize + count as usize > 0x1_0000 {
                    return FinsResponse::encode(
                        reply_header,
                        MRC_MEMORY_AREA,
                        SRC_MEMORY_READ,
                        END_RANGE_EXCEEDED,
                        &[],
                    );
                }
                let mut data = Vec::with_capacity(count as usize * 2);
                for i in 0..count {
                    let word = state.memory.get(&(address + i)).copied().unwrap_or(0);
                    data.extend_from_slice(&word.to_be_bytes());
                }
                FinsResponse::encode(reply_header, MRC_MEMORY_AREA, SRC_MEMORY_READ, END_OK, &data)
            }
            AreaRequest::Write { address, data, .. } => {
                let end_code = if address as usize + data.len() > 0x1_0000 {
                    Some(END_RANGE_EXCEEDED)
                } else {
                    state
                        .rejected_writes
                        .iter()
                        .find(|(range, _)| overlaps(range, address, data.len()))
                        .map(|(_, code)| *code)
                };
                if let Some(code) = end_code {
                    return FinsResponse::encode(
                        reply_header,
                        MRC_MEMORY_AREA,
                        SRC_MEMORY_WRITE,
                        code,
                        &[],
                    );
                }
                for (i, word) in data.iter().enumerate() {
                    state.memory.insert(address + i as u16, *word);
                }
                state.write_log.push((address, data.len()));
                FinsResponse::encode(reply_header, MRC_MEMORY_AREA, SRC_MEMORY_WRITE, END_OK, &[])
            }
        }
    }
}

#[async_trait]
impl Transport for SimulatedPlc {
    async fn exchange(&self, frame: &[u8]) -> Result<Vec<u8>> {
        {
            let mut state = self.state.lock();
            state.exchanges += 1;
            if state.pending_timeouts > 0 {
                state.pending_timeouts -= 1;
                return Err(FinsError::Timeout);
            }
        }

        match AreaRequest::parse(frame) {
            Ok((header, request)) => Ok(self.handle(header, request)),
            Err(err) => {
                let header = FinsHeader::from_bytes(frame)?;
                tracing::debug!(error = %err, "simulated PLC rejected frame");
                Ok(FinsResponse::encode(
                    FinsHeader::response_to(&header),
                    frame.get(10).copied().unwrap_or(0),
                    frame.get(11).copied().unwrap_or(0),
                    END_FORMAT_ERROR,
                    &[],
                ))
            }
        }
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        // Every request is answered inside its own exchange.
        Err(FinsError::Timeout)
    }

    fn describe(&self) -> String {
        "simulated PLC".to_string()
    }
}
