use std::sync::Arc;

use framebus_frame::FrameRecord;
use framebus_icc::{Broker, IccError, PublishOutcome, SlotWriter};

/// Whether a frame left the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Written,
    /// No room for it; it is gone.
    Dropped,
}

/// Somewhere a producer can hand finished frames.
pub trait FrameSink: Send {
    fn publish(&mut self, record: &FrameRecord) -> Result<SinkOutcome, IccError>;
}

impl FrameSink for SlotWriter {
    fn publish(&mut self, record: &FrameRecord) -> Result<SinkOutcome, IccError> {
        SlotWriter::publish(self, record)?;
        Ok(SinkOutcome::Written)
    }
}

impl FrameSink for Arc<Broker> {
    fn publish(&mut self, record: &FrameRecord) -> Result<SinkOutcome, IccError> {
        Ok(match Broker::publish(self, record)? {
            PublishOutcome::Dropped => SinkOutcome::Dropped,
            PublishOutcome::NoClients | PublishOutcome::Delivered(_) => SinkOutcome::Written,
        })
    }
}
