//! Control-channel messages between a broker and its clients.
//!
//! Every message is framed as `[len: u32][tag: u8][payload]`, where `len`
//! counts the tag and payload. Integers are native-endian: both ends share a
//! host.
//!
//! | tag | message | direction        | payload                                        |
//! |-----|---------|------------------|------------------------------------------------|
//! | 1   | Hello   | broker -> client | version u32, block_size u64, block_count u32, format (36B), arena path |
//! | 2   | Block   | broker -> client | block_id u32, offset u64, len u32              |
//! | 3   | Ack     | client -> broker | block_id u32                                   |

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use framebus_frame::{LayoutError, STREAM_FORMAT_SIZE, StreamFormat};

/// Bumped on any incompatible change to the messages below.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on `len`; anything larger is a corrupt or hostile stream.
pub const MAX_MESSAGE: usize = 4096;

const TAG_HELLO: u8 = 1;
const TAG_BLOCK: u8 = 2;
const TAG_ACK: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        version: u32,
        arena_path: PathBuf,
        block_size: u64,
        block_count: u32,
        format: StreamFormat,
    },
    Block {
        block_id: u32,
        offset: u64,
        len: u32,
    },
    Ack {
        block_id: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message length {0} outside 1..={MAX_MESSAGE}")]
    BadLength(usize),

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("malformed {0} message")]
    Malformed(&'static str),

    #[error("malformed stream format in hello")]
    Format(#[from] LayoutError),
}

impl Message {
    /// Encodes the message with its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        match self {
            Message::Hello {
                version,
                arena_path,
                block_size,
                block_count,
                format,
            } => {
                body.push(TAG_HELLO);
                body.extend_from_slice(&version.to_ne_bytes());
                body.extend_from_slice(&block_size.to_ne_bytes());
                body.extend_from_slice(&block_count.to_ne_bytes());
                let mut f = [0u8; STREAM_FORMAT_SIZE];
                // A fixed-size array is always large enough.
                let _ = format.encode_into(&mut f);
                body.extend_from_slice(&f);
                body.extend_from_slice(arena_path.as_os_str().as_bytes());
            }
            Message::Block {
                block_id,
                offset,
                len,
            } => {
                body.push(TAG_BLOCK);
                body.extend_from_slice(&block_id.to_ne_bytes());
                body.extend_from_slice(&offset.to_ne_bytes());
                body.extend_from_slice(&len.to_ne_bytes());
            }
            Message::Ack { block_id } => {
                body.push(TAG_ACK);
                body.extend_from_slice(&block_id.to_ne_bytes());
            }
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn decode_body(body: &[u8]) -> Result<Self, WireError> {
        let (&tag, rest) = body.split_first().ok_or(WireError::BadLength(0))?;
        match tag {
            TAG_HELLO => {
                const FIXED: usize = 4 + 8 + 4 + STREAM_FORMAT_SIZE;
                if rest.len() < FIXED {
                    return Err(WireError::Malformed("hello"));
                }
                Ok(Message::Hello {
                    version: u32_at(rest, 0),
                    block_size: u64_at(rest, 4),
                    block_count: u32_at(rest, 12),
                    format: StreamFormat::decode(&rest[16..16 + STREAM_FORMAT_SIZE])?,
                    arena_path: PathBuf::from(OsStr::from_bytes(&rest[FIXED..])),
                })
            }
            TAG_BLOCK => {
                if rest.len() != 16 {
                    return Err(WireError::Malformed("block"));
                }
                Ok(Message::Block {
                    block_id: u32_at(rest, 0),
                    offset: u64_at(rest, 4),
                    len: u32_at(rest, 12),
                })
            }
            TAG_ACK => {
                if rest.len() != 4 {
                    return Err(WireError::Malformed("ack"));
                }
                Ok(Message::Ack {
                    block_id: u32_at(rest, 0),
                })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn u64_at(b: &[u8], at: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[at..at + 8]);
    u64::from_ne_bytes(w)
}

/// Reassembles messages from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, WireError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32_at(&self.buf, 0) as usize;
        if len == 0 || len > MAX_MESSAGE {
            return Err(WireError::BadLength(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let msg = Message::decode_body(&self.buf[4..4 + len]);
        self.buf.drain(..4 + len);
        msg.map(Some)
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
