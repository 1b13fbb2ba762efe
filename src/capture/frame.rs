use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::FrameError;

/// Frame as presented by a video source, before readback.
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Time the source produced the frame
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row. Anything below the packed row length means no padding.
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed layouts. `None` for compressed formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => Some(4),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }

    /// V4L2 four-character code for this layout.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Rgba32 => *b"AB24",
            PixelFormat::Bgra32 => *b"AR24",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"AB24" => Some(PixelFormat::Rgba32),
            b"AR24" => Some(PixelFormat::Bgra32),
            b"YUYV" => Some(PixelFormat::Yuyv4),
            // Motion-JPEG drivers report either code
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// Raw pixels returned by a readback request.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Wall-clock time the pixels were read back
    pub timestamp: DateTime<Utc>,
}

impl PixelBuffer {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
            timestamp: Utc::now(),
        }
    }
}

/// Decoded RGBA8 image. `width * height * 4 == data.len()` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl FrameImage {
    pub const CHANNELS: usize = 4;

    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * Self::CHANNELS;
        if data.len() != expected {
            return Err(FrameError::InvariantViolation {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Caller guarantees `data.len() == width * height * 4`.
    pub(crate) fn from_rgba_unchecked(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * Self::CHANNELS);
        Self {
            width,
            height,
            data,
        }
    }

    /// Assemble an image from a readback buffer, expanding packed layouts to RGBA.
    pub fn from_pixel_buffer(buffer: &PixelBuffer) -> Result<Self, FrameError> {
        let (bpp, expand): (usize, fn(&[u8]) -> [u8; 4]) = match buffer.format {
            PixelFormat::Rgba32 => (4, |px| [px[0], px[1], px[2], px[3]]),
            PixelFormat::Bgra32 => (4, |px| [px[2], px[1], px[0], px[3]]),
            PixelFormat::Rgb24 => (3, |px| [px[0], px[1], px[2], 255]),
            PixelFormat::Bgr24 => (3, |px| [px[2], px[1], px[0], 255]),
            PixelFormat::Yuyv4 | PixelFormat::Mjpeg => {
                return Err(FrameError::UnsupportedFormat(buffer.format))
            }
        };

        let expected = buffer.width as usize * buffer.height as usize * bpp;
        if buffer.data.len() != expected {
            return Err(FrameError::InvariantViolation {
                expected,
                actual: buffer.data.len(),
            });
        }

        let rgba = buffer.data.chunks_exact(bpp).flat_map(expand).collect();

        Self::from_rgba(buffer.width, buffer.height, rgba)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// RGBA value at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_buffer_expands_to_opaque_rgba() {
        let buf = PixelBuffer::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Rgb24);
        let img = FrameImage::from_pixel_buffer(&buf).unwrap();
        assert_eq!(img.as_bytes(), &[1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn bgra_buffer_is_swizzled() {
        let buf = PixelBuffer::new(vec![10, 20, 30, 40], 1, 1, PixelFormat::Bgra32);
        let img = FrameImage::from_pixel_buffer(&buf).unwrap();
        assert_eq!(img.pixel(0, 0), [30, 20, 10, 40]);
    }

    #[test]
    fn short_buffer_violates_invariant() {
        let buf = PixelBuffer::new(vec![0u8; 15], 2, 2, PixelFormat::Rgba32);
        assert_eq!(
            FrameImage::from_pixel_buffer(&buf),
            Err(FrameError::InvariantViolation {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn compressed_buffer_is_rejected() {
        let buf = PixelBuffer::new(vec![0u8; 8], 2, 2, PixelFormat::Mjpeg);
        assert_eq!(
            FrameImage::from_pixel_buffer(&buf),
            Err(FrameError::UnsupportedFormat(PixelFormat::Mjpeg))
        );
    }

    #[test]
    fn fourcc_codes_map_both_ways() {
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv4));
        assert_eq!(PixelFormat::from_fourcc(b"JPEG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(b"NV12"), None);
        for format in [PixelFormat::Rgb24, PixelFormat::Bgra32, PixelFormat::Mjpeg] {
            assert_eq!(PixelFormat::from_fourcc(&format.fourcc()), Some(format));
        }
    }

    #[test]
    fn from_rgba_checks_length() {
        assert!(FrameImage::from_rgba(3, 2, vec![0; 24]).is_ok());
        assert!(FrameImage::from_rgba(3, 2, vec![0; 23]).is_err());
    }
}
