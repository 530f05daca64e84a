use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use framebus_frame::{FrameRecord, StreamFormat};
use tracing::debug;

use crate::IccError;
use crate::arena::ArenaView;
use crate::wire::{Decoder, Message, PROTOCOL_VERSION};

/// A broker that accepted at the socket level but never greets us is
/// treated as absent after this long.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(1);

/// Consumer end of a broker connection.
pub struct BrokerClient {
    stream: UnixStream,
    decoder: Decoder,
    arena: ArenaView,
    format: StreamFormat,
    socket_path: PathBuf,
}

impl BrokerClient {
    /// Connects, reads the broker's `Hello` and maps the announced arena.
    ///
    /// With `expected` set, a broker producing any other stream shape is
    /// refused with [`IccError::FormatMismatch`]. A broker whose event loop
    /// does not greet within [`HELLO_TIMEOUT`] yields
    /// [`IccError::HandshakeTimeout`].
    pub fn connect<P: AsRef<Path>>(
        socket_path: P,
        expected: Option<&StreamFormat>,
    ) -> Result<Self, IccError> {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path).map_err(|source| IccError::Connect {
            path: socket_path.to_path_buf(),
            source,
        })?;
        let mut decoder = Decoder::new();

        stream.set_read_timeout(Some(HELLO_TIMEOUT))?;
        let hello = match read_message(&stream, &mut decoder) {
            Err(IccError::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                return Err(IccError::HandshakeTimeout {
                    path: socket_path.to_path_buf(),
                    timeout: HELLO_TIMEOUT,
                });
            }
            other => other?,
        };
        stream.set_read_timeout(None)?;
        let Message::Hello {
            version,
            arena_path,
            block_size,
            block_count,
            format,
        } = hello
        else {
            return Err(IccError::Protocol(format!("expected hello, got {hello:?}")));
        };
        if version != PROTOCOL_VERSION {
            return Err(IccError::Protocol(format!(
                "broker speaks protocol {version}, this client {PROTOCOL_VERSION}"
            )));
        }
        if let Some(expected) = expected {
            expected.check_compatible(&format)?;
        }
        let block_size = usize::try_from(block_size)
            .map_err(|_| IccError::Protocol(format!("block size {block_size} too large")))?;
        let arena = ArenaView::open(&arena_path, block_size, block_count)?;
        debug!(
            socket = %socket_path.display(),
            arena = %arena_path.display(),
            "connected to broker"
        );

        Ok(Self {
            stream,
            decoder,
            arena,
            format,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// Blocks for the next frame, copies it out and acknowledges the block.
    ///
    /// The block is acknowledged even if its contents fail to decode, so a
    /// bad frame never pins arena space.
    pub fn recv(&mut self) -> Result<FrameRecord, IccError> {
        match read_message(&self.stream, &mut self.decoder)? {
            Message::Block {
                block_id,
                offset,
                len,
            } => {
                let record = self.arena.read(block_id, offset, len);
                (&self.stream).write_all(&Message::Ack { block_id }.encode())?;
                record
            }
            other => Err(IccError::Protocol(format!("expected block, got {other:?}"))),
        }
    }

    /// Handle that unblocks a pending [`BrokerClient::recv`], which then
    /// fails with [`IccError::Disconnected`].
    pub fn interrupter(&self) -> Result<BrokerClientInterrupter, IccError> {
        Ok(BrokerClientInterrupter {
            stream: self.stream.try_clone()?,
        })
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

pub struct BrokerClientInterrupter {
    stream: UnixStream,
}

impl BrokerClientInterrupter {
    pub fn interrupt(&self) -> Result<(), IccError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already torn down by the peer.
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_message(mut stream: &UnixStream, decoder: &mut Decoder) -> Result<Message, IccError> {
    let mut buf = [0u8; 512];
    loop {
        if let Some(msg) = decoder.next_message()? {
            return Ok(msg);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(IccError::Disconnected);
        }
        decoder.feed(&buf[..n]);
    }
}
