use framebus_frame::{FormatMismatch, LayoutError};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::arena::ArenaError;
use crate::wire::WireError;

/// Errors from the shared-memory transports.
#[derive(Debug, thiserror::Error)]
pub enum IccError {
    #[error("failed to map segment '{}'", path.display())]
    Segment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{}' is not a usable frame segment: {reason}", path.display())]
    InvalidSegment { path: PathBuf, reason: &'static str },

    #[error("segment '{}' has no live writer", path.display())]
    NotReady { path: PathBuf },

    #[error("process-shared primitive failed")]
    Sync(#[source] io::Error),

    #[error("record of {len} bytes does not fit the {capacity} byte slot")]
    RecordTooLarge { len: usize, capacity: usize },

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    FormatMismatch(#[from] FormatMismatch),

    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("failed to bind control channel '{}'", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to control channel '{}'", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no hello from broker at '{}' within {timeout:?}", path.display())]
    HandshakeTimeout { path: PathBuf, timeout: Duration },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unknown client {0}")]
    UnknownClient(u64),

    #[error("peer closed the control channel")]
    Disconnected,

    #[error("control channel I/O failed")]
    Io(#[from] io::Error),
}
