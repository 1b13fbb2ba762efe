pub mod gallery;

use std::path::PathBuf;

use crate::capture::FrameImage;

pub use gallery::GalleryStore;

/// Result of a single save attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub permission_granted: bool,
    pub path: Option<PathBuf>,
    pub success: bool,
}

impl SaveOutcome {
    pub fn saved(path: PathBuf) -> Self {
        Self {
            permission_granted: true,
            path: Some(path),
            success: true,
        }
    }

    pub fn denied() -> Self {
        Self {
            permission_granted: false,
            path: None,
            success: false,
        }
    }

    pub fn failed(path: Option<PathBuf>) -> Self {
        Self {
            permission_granted: true,
            path,
            success: false,
        }
    }
}

/// Persistent image storage with a permission precondition.
///
/// `save` is blocking; callers on an async runtime run it on the blocking pool.
pub trait ImageStore: Send + Sync {
    fn has_permission(&self) -> bool;

    fn save(&self, image: &FrameImage, album: &str, filename: &str) -> SaveOutcome;
}
