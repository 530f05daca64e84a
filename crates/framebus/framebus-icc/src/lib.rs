mod arena;
mod broker;
mod client;
mod error;
mod registry;
mod shm_layout;
mod slot;
mod sync;
mod wire;

pub use arena::{Arena, ArenaError, ArenaView, Block, bytes_for_arena};
pub use broker::{Broker, BrokerConfig, BrokerShutdown, PublishOutcome};
pub use client::{BrokerClient, BrokerClientInterrupter, HELLO_TIMEOUT};
pub use error::IccError;
pub use registry::ClientId;
pub use shm_layout::{PAYLOAD_OFFSET, SegmentState, bytes_for_slot};
pub use slot::{CreatePolicy, LatestFrame, SlotInterrupter, SlotReader, SlotWriter};
pub use wire::{Decoder, MAX_MESSAGE, Message, PROTOCOL_VERSION, WireError};
