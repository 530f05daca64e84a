//! Transport-neutral view of "a live connection to a producer".
//!
//! The supervisor only knows how to open a channel, read frames from it and
//! interrupt a blocked read. [`SlotConnector`] and [`BrokerConnector`] adapt
//! the two shared-memory transports to that shape.

use std::fmt;
use std::path::PathBuf;

use framebus_frame::{FrameRecord, StreamFormat};
use framebus_icc::{BrokerClient, IccError, SlotReader};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Icc(#[from] IccError),

    #[error("failed to start read thread")]
    Spawn(#[source] std::io::Error),
}

/// Unblocks a read in progress on another thread.
pub struct Interrupter(Box<dyn Fn() + Send + Sync>);

impl Interrupter {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn interrupt(&self) {
        (self.0)()
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interrupter")
    }
}

pub trait FrameChannel: Send {
    /// Blocks for the next frame. `Ok(None)` means the producer went away in
    /// an orderly fashion or the read was interrupted.
    fn recv(&mut self) -> Result<Option<FrameRecord>, ChannelError>;

    fn interrupter(&self) -> Result<Interrupter, ChannelError>;
}

pub trait Connector: Send + 'static {
    type Channel: FrameChannel + 'static;

    fn connect(&mut self) -> Result<Self::Channel, ChannelError>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

pub struct SlotChannel {
    reader: SlotReader,
    last: Option<u32>,
}

impl FrameChannel for SlotChannel {
    fn recv(&mut self) -> Result<Option<FrameRecord>, ChannelError> {
        let Some(latest) = self.reader.read_latest(self.last)? else {
            return Ok(None);
        };
        self.last = Some(latest.record.frame_number());
        Ok(Some(latest.record))
    }

    fn interrupter(&self) -> Result<Interrupter, ChannelError> {
        let handle = self.reader.interrupter();
        Ok(Interrupter::new(move || {
            let _ = handle.interrupt();
        }))
    }
}

/// Opens the single-slot segment at `path`.
#[derive(Debug, Clone)]
pub struct SlotConnector {
    pub path: PathBuf,
    pub expected: Option<StreamFormat>,
}

impl Connector for SlotConnector {
    type Channel = SlotChannel;

    fn connect(&mut self) -> Result<SlotChannel, ChannelError> {
        let reader = match &self.expected {
            Some(fmt) => SlotReader::open_expecting(&self.path, fmt)?,
            None => SlotReader::open(&self.path)?,
        };
        Ok(SlotChannel { reader, last: None })
    }

    fn describe(&self) -> String {
        format!("slot {}", self.path.display())
    }
}

pub struct BrokerChannel {
    client: BrokerClient,
}

impl FrameChannel for BrokerChannel {
    fn recv(&mut self) -> Result<Option<FrameRecord>, ChannelError> {
        match self.client.recv() {
            Ok(rec) => Ok(Some(rec)),
            Err(IccError::Disconnected) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn interrupter(&self) -> Result<Interrupter, ChannelError> {
        let handle = self.client.interrupter()?;
        Ok(Interrupter::new(move || {
            let _ = handle.interrupt();
        }))
    }
}

/// Connects to a broker's control socket at `socket_path`.
#[derive(Debug, Clone)]
pub struct BrokerConnector {
    pub socket_path: PathBuf,
    pub expected: Option<StreamFormat>,
}

impl Connector for BrokerConnector {
    type Channel = BrokerChannel;

    fn connect(&mut self) -> Result<BrokerChannel, ChannelError> {
        let client = BrokerClient::connect(&self.socket_path, self.expected.as_ref())?;
        Ok(BrokerChannel { client })
    }

    fn describe(&self) -> String {
        format!("broker {}", self.socket_path.display())
    }
}
