#![forbid(unsafe_code)]

//! Fixed-width frame header.
//!
//! ```text
//! offset  field
//!   0     frame_number
//!   4     frame_rate_num
//!   8     frame_rate_den
//!  12     image_format
//!  16     width
//!  20     height
//!  24     image_size
//!  28     audio_format
//!  32     frequency
//!  36     channels
//!  40     samples
//!  44     audio_size
//!  48     image payload, then audio payload
//! ```
//!
//! Every field is a native-endian `u32`: producer and consumer always share
//! a host, so there is nothing to gain from a byte-order conversion.

use crate::LayoutError;

/// Number of `u32` words in the header.
const HEADER_WORDS: usize = 12;

/// Size in bytes of the encoded [`FrameHeader`].
pub const HEADER_SIZE: usize = HEADER_WORDS * 4;

/// Header that precedes every frame payload.
///
/// The format fields are kept as raw tags here; [`crate::FrameRecord`]
/// turns them into typed formats and checks them against the sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_number: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub image_format: u32,
    pub width: u32,
    pub height: u32,
    pub image_size: u32,
    pub audio_format: u32,
    pub frequency: u32,
    pub channels: u32,
    pub samples: u32,
    pub audio_size: u32,
}

impl FrameHeader {
    fn words(&self) -> [u32; HEADER_WORDS] {
        [
            self.frame_number,
            self.frame_rate_num,
            self.frame_rate_den,
            self.image_format,
            self.width,
            self.height,
            self.image_size,
            self.audio_format,
            self.frequency,
            self.channels,
            self.samples,
            self.audio_size,
        ]
    }

    /// Total bytes this header declares, itself included.
    #[inline]
    pub fn record_len(&self) -> usize {
        HEADER_SIZE + self.image_size as usize + self.audio_size as usize
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), LayoutError> {
        if buf.len() < HEADER_SIZE {
            return Err(LayoutError::BufferTooSmall {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        for (chunk, word) in buf[..HEADER_SIZE].chunks_exact_mut(4).zip(self.words()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        if buf.len() < HEADER_SIZE {
            return Err(LayoutError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        let mut w = [0u32; HEADER_WORDS];
        for (slot, chunk) in w.iter_mut().zip(buf[..HEADER_SIZE].chunks_exact(4)) {
            *slot = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self {
            frame_number: w[0],
            frame_rate_num: w[1],
            frame_rate_den: w[2],
            image_format: w[3],
            width: w[4],
            height: w[5],
            image_size: w[6],
            audio_format: w[7],
            frequency: w[8],
            channels: w[9],
            samples: w[10],
            audio_size: w[11],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_twelve_words() {
        assert_eq!(HEADER_SIZE, 48, "header layout changed");
    }

    /// Field order on the wire is fixed; check a few offsets directly.
    #[test]
    fn fields_land_at_fixed_offsets() {
        let h = FrameHeader {
            frame_number: 7,
            image_size: 0xAABB,
            audio_size: 0xCCDD,
            ..FrameHeader::default()
        };
        let mut buf = [0u8; HEADER_SIZE];
        h.encode_into(&mut buf).unwrap();
        assert_eq!(&buf[0..4], &7u32.to_ne_bytes());
        assert_eq!(&buf[24..28], &0xAABBu32.to_ne_bytes());
        assert_eq!(&buf[44..48], &0xCCDDu32.to_ne_bytes());
    }

    #[test]
    fn short_buffers_are_rejected() {
        let h = FrameHeader::default();
        let mut small = [0u8; HEADER_SIZE - 1];
        assert!(h.encode_into(&mut small).is_err());
        assert!(matches!(
            FrameHeader::decode(&small),
            Err(LayoutError::Truncated { needed: HEADER_SIZE, .. })
        ));
    }
}
