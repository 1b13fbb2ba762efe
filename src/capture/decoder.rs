use bytes::Bytes;
use jpeg_decoder::Decoder;

use super::frame::{Frame, PixelBuffer, PixelFormat};
use crate::error::ReadbackError;

/// Decode a source frame into a raw pixel buffer.
///
/// Packed RGB/BGR layouts pass through with any row padding removed; MJPEG
/// and YUYV are converted to RGB24.
pub fn decode_frame(frame: &Frame) -> Result<PixelBuffer, ReadbackError> {
    let meta = &frame.meta;
    let (data, format) = match meta.format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(&frame.data[..]);
            let pixels = decoder.decode().map_err(|e| ReadbackError::Decode {
                format: meta.format,
                reason: e.to_string(),
            })?;
            (Bytes::from(pixels), PixelFormat::Rgb24)
        }
        PixelFormat::Yuyv4 => {
            let packed = packed_rows(frame, 2)?;
            (
                Bytes::from(yuyv_to_rgb(&packed, meta.width, meta.height)?),
                PixelFormat::Rgb24,
            )
        }
        // Already raw
        format => {
            let bpp = format.bytes_per_pixel().unwrap_or(1);
            (packed_rows(frame, bpp)?, format)
        }
    };

    Ok(PixelBuffer::new(data, meta.width, meta.height, format))
}

/// Frame data with rows laid back to back, `width * bpp` bytes each.
fn packed_rows(frame: &Frame, bpp: usize) -> Result<Bytes, ReadbackError> {
    let meta = &frame.meta;
    let row = meta.width as usize * bpp;
    let rows = meta.height as usize;
    let stride = (meta.stride as usize).max(row);

    // The last row needs no trailing padding
    let needed = rows.checked_sub(1).map_or(0, |n| n * stride + row);
    if frame.data.len() < needed {
        return Err(ReadbackError::Decode {
            format: meta.format,
            reason: format!(
                "{} bytes for {}x{} with stride {}",
                frame.data.len(),
                meta.width,
                meta.height,
                stride
            ),
        });
    }

    if stride == row {
        return Ok(frame.data.slice(..row * rows));
    }
    let mut packed = Vec::with_capacity(row * rows);
    for line in frame.data.chunks(stride).take(rows) {
        packed.extend_from_slice(&line[..row]);
    }
    Ok(Bytes::from(packed))
}

/// BT.601 YUYV 4:2:2 to RGB24.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ReadbackError> {
    let pixels = width as usize * height as usize;
    if data.len() < pixels * 2 || pixels % 2 != 0 {
        return Err(ReadbackError::Decode {
            format: PixelFormat::Yuyv4,
            reason: format!("{} bytes for {}x{}", data.len(), width, height),
        });
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}
