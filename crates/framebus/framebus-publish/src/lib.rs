//! Producer side: a paced write thread feeding a slot or a broker.

pub mod engine;
pub mod pacer;
pub mod pattern;
pub mod sink;

use framebus_frame::LayoutError;
use framebus_icc::IccError;

pub use engine::{EngineOptions, FrameProducer, PublishEngine, PublishStats};
pub use pacer::Pacer;
pub use pattern::TestPattern;
pub use sink::{FrameSink, SinkOutcome};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid frame rate {num}/{den}")]
    InvalidRate { num: u32, den: u32 },

    #[error(transparent)]
    Icc(#[from] IccError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("failed to start write thread")]
    Spawn(#[source] std::io::Error),

    #[error("write thread panicked")]
    WorkerPanicked,
}
