pub mod decoder;
pub mod frame;
pub mod pattern;
pub mod readback;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Frame, FrameImage, PixelBuffer, PixelFormat};
pub use pattern::PatternSource;
pub use readback::{AsyncPixelReadback, DecodeReadback, ReadbackFuture};
pub use source::{Resolution, VideoSource};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
