//! Real-time progress fanout for generation jobs.
//!
//! This crate provides:
//! - `ProgressBus` - a subscriber registry keyed by client id, prompt id,
//!   and room, with capacity limits, heartbeats, and idle eviction
//! - `ProgressEvent` / `InboundMessage` - the wire protocol frames
//! - `ProgressTracker` - per-prompt execution progress with ETA, emitting
//!   lifecycle events through the bus
//!
//! A subscriber is an unbounded channel sender; the transport layer (the
//! WebSocket endpoint) pumps the paired receiver into the socket. Sends to
//! distinct subscribers therefore proceed in parallel, while index
//! mutation is serialized behind one lock.

pub mod bus;
pub mod events;
pub mod tracker;

pub use bus::{BusError, ProgressBus, HEARTBEAT_INTERVAL, STALE_AFTER};
pub use events::{InboundMessage, ProgressEvent};
pub use tracker::ProgressTracker;
