//! Asynchronous pixel readback

use std::future::Future;
use std::pin::Pin;

use tracing::instrument;

use super::decoder;
use super::frame::{Frame, PixelBuffer};
use crate::error::ReadbackError;

pub type ReadbackFuture = Pin<Box<dyn Future<Output = Result<PixelBuffer, ReadbackError>> + Send>>;

/// Turns a source surface into raw pixels. Completion is asynchronous and
/// completions of different requests may arrive in any order.
pub trait AsyncPixelReadback: Send + Sync {
    fn request(&self, surface: Frame) -> ReadbackFuture;
}

/// CPU readback: decodes the surface on Tokio's blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeReadback;

impl AsyncPixelReadback for DecodeReadback {
    #[instrument(skip_all, fields(sequence = surface.meta.sequence))]
    fn request(&self, surface: Frame) -> ReadbackFuture {
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || decoder::decode_frame(&surface)).await {
                Ok(result) => result,
                Err(e) => Err(ReadbackError::Driver(e.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn decode_readback_resolves_to_pixels() {
        let surface = Frame {
            data: Bytes::from(vec![1u8; 2 * 2 * 3]),
            meta: Arc::new(FrameMetadata {
                sequence: 4,
                width: 2,
                height: 2,
                stride: 6,
                format: PixelFormat::Rgb24,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        };

        let pixels = DecodeReadback.request(surface).await.unwrap();
        assert_eq!((pixels.width, pixels.height), (2, 2));
        assert_eq!(pixels.data.len(), 12);
    }
}
