//! Consumer side of the frame bus: a reconnecting read thread feeding a
//! bounded queue that the pipeline pulls from.

pub mod channel;
pub mod queue;
pub mod sequence;
pub mod source;
pub mod supervisor;

pub use channel::{
    BrokerChannel, BrokerConnector, ChannelError, Connector, FrameChannel, Interrupter,
    SlotChannel, SlotConnector,
};
pub use queue::{FrameQueue, QueueError};
pub use sequence::SequenceTracker;
pub use source::{FrameSource, SourceError, SourceOptions};
pub use supervisor::{LinkState, LinkStateMachine, Supervisor, SupervisorControl};
