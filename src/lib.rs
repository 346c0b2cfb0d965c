//! # FINS Gateway
//!
//! Moves manufacturing batches between an ERP and an Omron PLC speaking
//! FINS over UDP.
//!
//! The gateway pulls pending work orders from the ERP, writes them into PLC
//! data-memory slots, follows their execution through read slots, and
//! reports consumption back when the PLC finishes a batch (or cancels the
//! work order when it fails). Every batch in flight is persisted in SQLite,
//! so the gateway can stop and resume at any point.
//!
//! ## Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`FinsClient`], [`Transport`] | one request, one reply; SID correlation |
//! | [`marshal`] | typed fields to and from words, sentinel detection |
//! | [`memory_map`] | slot layout, address arithmetic |
//! | [`registers`] | whole-slot reads and field-by-field writes |
//! | [`handshake`] | write/read/failure channel flags |
//! | [`store`] | active batches, history and event log |
//! | [`erp`] | ERP HTTP client |
//! | [`orchestrator`] | intake, telemetry, settlement and maintenance tasks |
//! | [`scheduler`] | periodic task loops |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fins_gateway::handshake::{Handshake, RetryPolicy};
//! use fins_gateway::memory_map::MemoryMap;
//! use fins_gateway::registers::EquipmentRegisters;
//! use fins_gateway::{FinsClient, NodeAddress, UdpTransport, DEFAULT_TIMEOUT};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let transport = UdpTransport::connect("192.168.1.250:9600".parse()?, DEFAULT_TIMEOUT).await?;
//! let client = FinsClient::new(transport, NodeAddress::new(0, 1, 0), NodeAddress::new(0, 0, 0));
//! let registers = EquipmentRegisters::new(Arc::new(client), Arc::new(MemoryMap::standard()));
//! let handshake = Handshake::new(registers, RetryPolicy::default());
//!
//! println!("write flag = {}", handshake.write_flag_value().await?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Each layer has its own error enum ([`FinsError`], [`marshal::MarshalError`],
//! [`registers::RegisterError`], ...) and tasks aggregate them into
//! [`orchestrator::SyncError`]. Nothing in the library panics on bad PLC or
//! ERP data.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod client;
mod command;
mod error;
mod header;
mod memory;
mod response;
mod transport;

pub mod batch;
pub mod config;
pub mod erp;
pub mod handshake;
pub mod logging;
pub mod marshal;
pub mod memory_map;
pub mod ops;
pub mod orchestrator;
pub mod registers;
pub mod scheduler;
pub mod sim;
pub mod store;

// Public re-exports
pub use client::{FinsClient, MAX_SID_RETRIES};
pub use command::{AreaRequest, ReadWordCommand, WriteWordCommand, MAX_WORDS_PER_COMMAND};
pub use error::{fins_error_description, FinsError, Result};
pub use header::{FinsHeader, NodeAddress, FINS_HEADER_SIZE};
pub use memory::MemoryArea;
pub use response::FinsResponse;
pub use sim::SimulatedPlc;
pub use transport::{Transport, UdpTransport, DEFAULT_FINS_PORT, DEFAULT_TIMEOUT, MAX_PACKET_SIZE};
