#![forbid(unsafe_code)]

use crate::format::{AudioFormat, ImageFormat, StreamFormat};
use crate::header::{FrameHeader, HEADER_SIZE};
use crate::LayoutError;

/// One audio+video frame, owned.
///
/// Construction checks that the payload lengths match what the header
/// declares, so a `FrameRecord` can always be serialized as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameRecord {
    header: FrameHeader,
    image: Vec<u8>,
    audio: Vec<u8>,
}

impl FrameRecord {
    /// Builds a record for `format`, checking both payloads against it.
    pub fn new(
        frame_number: u32,
        format: &StreamFormat,
        image: Vec<u8>,
        audio: Vec<u8>,
    ) -> Result<Self, LayoutError> {
        let image_size = format.image_size();
        if image.len() as u64 != image_size {
            return Err(LayoutError::PayloadMismatch {
                what: "image",
                declared: image_size,
                actual: image.len(),
            });
        }
        let audio_size = format.audio_size();
        if audio.len() as u64 != audio_size {
            return Err(LayoutError::PayloadMismatch {
                what: "audio",
                declared: audio_size,
                actual: audio.len(),
            });
        }
        let header = FrameHeader {
            frame_number,
            frame_rate_num: format.frame_rate_num,
            frame_rate_den: format.frame_rate_den,
            image_format: format.image_format.tag(),
            width: format.width,
            height: format.height,
            image_size: checked_u32("image", image_size)?,
            audio_format: format.audio_format.tag(),
            frequency: format.frequency,
            channels: format.channels,
            samples: format.samples,
            audio_size: checked_u32("audio", audio_size)?,
        };
        Ok(Self { header, image, audio })
    }

    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    #[inline]
    pub fn frame_number(&self) -> u32 {
        self.header.frame_number
    }

    #[inline]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    #[inline]
    pub fn audio(&self) -> &[u8] {
        &self.audio
    }

    /// Serialized length: header plus both payloads.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.header.record_len()
    }

    /// The stream shape this frame was produced with.
    pub fn stream_format(&self) -> Result<StreamFormat, LayoutError> {
        let h = &self.header;
        Ok(StreamFormat {
            image_format: ImageFormat::from_tag(h.image_format)?,
            width: h.width,
            height: h.height,
            audio_format: AudioFormat::from_tag(h.audio_format)?,
            frequency: h.frequency,
            channels: h.channels,
            samples: h.samples,
            frame_rate_num: h.frame_rate_num,
            frame_rate_den: h.frame_rate_den,
        })
    }

    /// Writes header, image and audio contiguously at the start of `buf`.
    /// Returns the number of bytes written.
    pub fn write_into(&self, buf: &mut [u8]) -> Result<usize, LayoutError> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(LayoutError::BufferTooSmall {
                needed: len,
                available: buf.len(),
            });
        }
        self.header.encode_into(buf)?;
        let image_end = HEADER_SIZE + self.image.len();
        buf[HEADER_SIZE..image_end].copy_from_slice(&self.image);
        buf[image_end..len].copy_from_slice(&self.audio);
        Ok(len)
    }

    /// Copies a record out of `buf`.
    ///
    /// Only `[0, header + image_size + audio_size)` is touched. The declared
    /// sizes must fit inside `buf` and agree with the declared formats and
    /// dimensions; anything else is reported rather than trusted.
    pub fn read_from(buf: &[u8]) -> Result<Self, LayoutError> {
        let header = FrameHeader::decode(buf)?;
        let len = header.record_len();
        if len > buf.len() {
            return Err(LayoutError::Truncated {
                needed: len,
                available: buf.len(),
            });
        }

        let image_format = ImageFormat::from_tag(header.image_format)?;
        let expected_image = image_format.image_size(header.width, header.height);
        if expected_image != header.image_size as u64 {
            return Err(LayoutError::PayloadMismatch {
                what: "image",
                declared: expected_image,
                actual: header.image_size as usize,
            });
        }
        let audio_format = AudioFormat::from_tag(header.audio_format)?;
        let expected_audio = audio_format.audio_size(header.samples, header.channels);
        if expected_audio != header.audio_size as u64 {
            return Err(LayoutError::PayloadMismatch {
                what: "audio",
                declared: expected_audio,
                actual: header.audio_size as usize,
            });
        }

        let image_end = HEADER_SIZE + header.image_size as usize;
        Ok(Self {
            header,
            image: buf[HEADER_SIZE..image_end].to_vec(),
            audio: buf[image_end..len].to_vec(),
        })
    }
}

fn checked_u32(what: &'static str, size: u64) -> Result<u32, LayoutError> {
    u32::try_from(size).map_err(|_| LayoutError::PayloadTooLarge { what, size })
}
