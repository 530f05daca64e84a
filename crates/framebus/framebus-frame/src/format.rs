#![forbid(unsafe_code)]

// Image and audio format tags as they appear on the wire, plus the size rules
// both sides of the bus use to agree on how many bytes a frame occupies.
// The tag values are part of the wire format: never renumber them.

use serde::{Deserialize, Serialize};

use crate::LayoutError;

/// Pixel layout of the image payload.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    None = 0,
    Rgb24 = 1,
    Rgb24a = 2,
    #[default]
    Yuv422 = 3,
    Yuv420p = 4,
}

impl ImageFormat {
    #[inline]
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Result<Self, LayoutError> {
        Ok(match tag {
            0 => Self::None,
            1 => Self::Rgb24,
            2 => Self::Rgb24a,
            3 => Self::Yuv422,
            4 => Self::Yuv420p,
            other => return Err(LayoutError::UnknownImageFormat(other)),
        })
    }

    /// Bytes needed for one `width` x `height` image in this format.
    ///
    /// Computed in `u64` so that absurd dimensions read off the wire cannot
    /// overflow before the caller gets a chance to reject them.
    pub fn image_size(self, width: u32, height: u32) -> u64 {
        let px = width as u64 * height as u64;
        match self {
            Self::None => 0,
            Self::Rgb24 => px * 3,
            Self::Rgb24a => px * 4,
            Self::Yuv422 => px * 2,
            Self::Yuv420p => px * 3 / 2,
        }
    }
}

/// Sample layout of the audio payload.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    None = 0,
    #[default]
    S16 = 1,
    S32 = 2,
    Float = 3,
    S32le = 4,
    F32le = 5,
    U8 = 6,
}

impl AudioFormat {
    #[inline]
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Result<Self, LayoutError> {
        Ok(match tag {
            0 => Self::None,
            1 => Self::S16,
            2 => Self::S32,
            3 => Self::Float,
            4 => Self::S32le,
            5 => Self::F32le,
            6 => Self::U8,
            other => return Err(LayoutError::UnknownAudioFormat(other)),
        })
    }

    /// Bytes per sample per channel.
    pub fn bytes_per_sample(self) -> u64 {
        match self {
            Self::None => 0,
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S32 | Self::Float | Self::S32le | Self::F32le => 4,
        }
    }

    pub fn audio_size(self, samples: u32, channels: u32) -> u64 {
        samples as u64 * channels as u64 * self.bytes_per_sample()
    }
}

/// Shape of every frame in one stream.
///
/// The producer sizes its segment (or arena blocks) from this, and a
/// consumer compares its expectation against it when it connects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    pub image_format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub audio_format: AudioFormat,
    pub frequency: u32,
    pub channels: u32,
    pub samples: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
}

/// Encoded size of a [`StreamFormat`]: nine `u32` fields.
pub const STREAM_FORMAT_SIZE: usize = 9 * 4;

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            image_format: ImageFormat::Yuv422,
            width: 1920,
            height: 1080,
            audio_format: AudioFormat::S16,
            frequency: 48_000,
            channels: 2,
            samples: 1_920,
            frame_rate_num: 25,
            frame_rate_den: 1,
        }
    }
}

impl StreamFormat {
    pub fn image_size(&self) -> u64 {
        self.image_format.image_size(self.width, self.height)
    }

    pub fn audio_size(&self) -> u64 {
        self.audio_format.audio_size(self.samples, self.channels)
    }

    /// Size of one serialized frame record of this format.
    pub fn record_size(&self) -> usize {
        required_size(
            self.image_format,
            self.width,
            self.height,
            self.audio_format,
            self.samples,
            self.channels,
        )
    }

    /// Compares two formats field by field and reports the first difference.
    pub fn check_compatible(&self, actual: &StreamFormat) -> Result<(), FormatMismatch> {
        let fields: [(&'static str, u32, u32); 9] = [
            ("image_format", self.image_format.tag(), actual.image_format.tag()),
            ("width", self.width, actual.width),
            ("height", self.height, actual.height),
            ("audio_format", self.audio_format.tag(), actual.audio_format.tag()),
            ("frequency", self.frequency, actual.frequency),
            ("channels", self.channels, actual.channels),
            ("samples", self.samples, actual.samples),
            ("frame_rate_num", self.frame_rate_num, actual.frame_rate_num),
            ("frame_rate_den", self.frame_rate_den, actual.frame_rate_den),
        ];
        match fields.iter().find(|(_, want, got)| want != got) {
            Some(&(field, expected, actual)) => Err(FormatMismatch {
                field,
                expected,
                actual,
            }),
            None => Ok(()),
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), LayoutError> {
        if buf.len() < STREAM_FORMAT_SIZE {
            return Err(LayoutError::BufferTooSmall {
                needed: STREAM_FORMAT_SIZE,
                available: buf.len(),
            });
        }
        let words = [
            self.image_format.tag(),
            self.width,
            self.height,
            self.audio_format.tag(),
            self.frequency,
            self.channels,
            self.samples,
            self.frame_rate_num,
            self.frame_rate_den,
        ];
        for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LayoutError> {
        if buf.len() < STREAM_FORMAT_SIZE {
            return Err(LayoutError::Truncated {
                needed: STREAM_FORMAT_SIZE,
                available: buf.len(),
            });
        }
        let word = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_ne_bytes(b)
        };
        Ok(Self {
            image_format: ImageFormat::from_tag(word(0))?,
            width: word(1),
            height: word(2),
            audio_format: AudioFormat::from_tag(word(3))?,
            frequency: word(4),
            channels: word(5),
            samples: word(6),
            frame_rate_num: word(7),
            frame_rate_den: word(8),
        })
    }
}

/// Producer and consumer disagree on the stream shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream format mismatch on `{field}`: expected {expected}, producer has {actual}")]
pub struct FormatMismatch {
    pub field: &'static str,
    pub expected: u32,
    pub actual: u32,
}

/// Total bytes for one frame record: header, image payload, audio payload.
///
/// Both producer and consumer must use this to size buffers; any
/// disagreement is a protocol error.
pub fn required_size(
    image_format: ImageFormat,
    width: u32,
    height: u32,
    audio_format: AudioFormat,
    samples: u32,
    channels: u32,
) -> usize {
    crate::HEADER_SIZE
        + image_format.image_size(width, height) as usize
        + audio_format.audio_size(samples, channels) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_sizes_follow_pixel_layout() {
        assert_eq!(ImageFormat::Yuv422.image_size(1920, 1080), 1920 * 1080 * 2);
        assert_eq!(ImageFormat::Rgb24.image_size(4, 2), 24);
        assert_eq!(ImageFormat::Rgb24a.image_size(4, 2), 32);
        assert_eq!(ImageFormat::Yuv420p.image_size(4, 2), 12);
        assert_eq!(ImageFormat::None.image_size(1920, 1080), 0);
    }

    #[test]
    fn audio_sizes_follow_sample_width() {
        assert_eq!(AudioFormat::S16.audio_size(1920, 2), 1920 * 2 * 2);
        assert_eq!(AudioFormat::U8.audio_size(10, 1), 10);
        assert_eq!(AudioFormat::F32le.audio_size(10, 2), 80);
        assert_eq!(AudioFormat::None.audio_size(10, 2), 0);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(matches!(ImageFormat::from_tag(99), Err(LayoutError::UnknownImageFormat(99))));
        assert!(matches!(AudioFormat::from_tag(7), Err(LayoutError::UnknownAudioFormat(7))));
    }

    #[test]
    fn required_size_is_header_plus_payloads() {
        let fmt = StreamFormat::default();
        let expected = crate::HEADER_SIZE + 1920 * 1080 * 2 + 1920 * 2 * 2;
        assert_eq!(fmt.record_size(), expected);
    }

    #[test]
    fn mismatch_names_first_differing_field() {
        let want = StreamFormat::default();
        let got = StreamFormat {
            width: 1280,
            height: 720,
            ..want
        };
        let err = want.check_compatible(&got).unwrap_err();
        assert_eq!(err.field, "width");
        assert_eq!(err.expected, 1920);
        assert_eq!(err.actual, 1280);
        assert!(want.check_compatible(&want).is_ok());
    }

    #[test]
    fn stream_format_survives_encoding() {
        let fmt = StreamFormat {
            image_format: ImageFormat::Rgb24a,
            audio_format: AudioFormat::F32le,
            ..StreamFormat::default()
        };
        let mut buf = [0u8; STREAM_FORMAT_SIZE];
        fmt.encode_into(&mut buf).unwrap();
        assert_eq!(StreamFormat::decode(&buf).unwrap(), fmt);
    }
}
