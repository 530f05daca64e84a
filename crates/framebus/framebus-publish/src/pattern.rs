#![forbid(unsafe_code)]

//! Synthetic frames: a horizontal luma ramp that slides one step per frame,
//! neutral chroma, silent audio.

use framebus_frame::{AudioFormat, FrameRecord, ImageFormat, StreamFormat};

use crate::PublishError;
use crate::engine::FrameProducer;

pub struct TestPattern {
    format: StreamFormat,
    audio: Vec<u8>,
}

impl TestPattern {
    pub fn new(format: StreamFormat) -> Self {
        let silence = match format.audio_format {
            AudioFormat::U8 => 0x80,
            _ => 0,
        };
        Self {
            audio: vec![silence; format.audio_size() as usize],
            format,
        }
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    /// Image bytes for frame `n`.
    pub fn image(&self, n: u32) -> Vec<u8> {
        let w = self.format.width as usize;
        let h = self.format.height as usize;
        let luma = |x: usize| (x as u32).wrapping_add(n) as u8;
        match self.format.image_format {
            ImageFormat::None => Vec::new(),
            ImageFormat::Rgb24 | ImageFormat::Rgb24a => {
                let bpp = if self.format.image_format == ImageFormat::Rgb24 { 3 } else { 4 };
                let mut row = Vec::with_capacity(w * bpp);
                for x in 0..w {
                    let y = luma(x);
                    row.extend_from_slice(&[y, y, y]);
                    if bpp == 4 {
                        row.push(0xFF);
                    }
                }
                row.repeat(h)
            }
            // Packed 4:2:2, two pixels per U Y V Y quad.
            ImageFormat::Yuv422 => {
                let mut row = Vec::with_capacity(w * 2);
                for x in 0..w {
                    row.push(0x80);
                    row.push(luma(x));
                }
                row.repeat(h)
            }
            // Planar 4:2:0: full Y plane then quarter-size U and V planes.
            ImageFormat::Yuv420p => {
                let row: Vec<u8> = (0..w).map(luma).collect();
                let mut img = row.repeat(h);
                img.resize(self.format.image_size() as usize, 0x80);
                img
            }
        }
    }
}

impl FrameProducer for TestPattern {
    fn produce(&mut self, frame_number: u32) -> Result<FrameRecord, PublishError> {
        Ok(FrameRecord::new(
            frame_number,
            &self.format,
            self.image(frame_number),
            self.audio.clone(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(image_format: ImageFormat, audio_format: AudioFormat) -> StreamFormat {
        StreamFormat {
            image_format,
            width: 6,
            height: 4,
            audio_format,
            samples: 10,
            ..StreamFormat::default()
        }
    }

    #[test]
    fn every_format_produces_a_valid_record() {
        for img in [
            ImageFormat::None,
            ImageFormat::Rgb24,
            ImageFormat::Rgb24a,
            ImageFormat::Yuv422,
            ImageFormat::Yuv420p,
        ] {
            let mut p = TestPattern::new(fmt(img, AudioFormat::S16));
            let rec = p.produce(3).unwrap();
            assert_eq!(rec.image().len() as u64, p.format().image_size(), "{img:?}");
        }
    }

    #[test]
    fn ramp_slides_with_frame_number() {
        let p = TestPattern::new(fmt(ImageFormat::Yuv422, AudioFormat::S16));
        let a = p.image(0);
        let b = p.image(1);
        assert_eq!(a[1], 0);
        assert_eq!(b[1], 1);
        assert_eq!(a[0], 0x80);
    }

    #[test]
    fn unsigned_audio_is_centred() {
        let mut p = TestPattern::new(fmt(ImageFormat::None, AudioFormat::U8));
        assert!(p.produce(0).unwrap().audio().iter().all(|&b| b == 0x80));
    }
}
