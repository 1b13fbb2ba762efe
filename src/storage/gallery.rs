//! Directory-backed gallery: `<root>/<album>/<filename>` PNG files

use std::fs;
use std::path::PathBuf;

use image::{ExtendedColorType, ImageFormat};
use tracing::{debug, error};

use super::{ImageStore, SaveOutcome};
use crate::capture::FrameImage;

#[derive(Debug, Clone)]
pub struct GalleryStore {
    root: PathBuf,
}

impl GalleryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ImageStore for GalleryStore {
    /// Writable root directory, created on demand.
    fn has_permission(&self) -> bool {
        if fs::create_dir_all(&self.root).is_err() {
            return false;
        }
        fs::metadata(&self.root)
            .map(|m| m.is_dir() && !m.permissions().readonly())
            .unwrap_or(false)
    }

    fn save(&self, image: &FrameImage, album: &str, filename: &str) -> SaveOutcome {
        if !self.has_permission() {
            return SaveOutcome::denied();
        }

        let dir = self.root.join(album);
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("Failed to create album {}: {}", dir.display(), e);
            return SaveOutcome::failed(None);
        }

        let path = dir.join(filename);
        match image::save_buffer_with_format(
            &path,
            image.as_bytes(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgba8,
            ImageFormat::Png,
        ) {
            Ok(()) => {
                debug!("Wrote {}", path.display());
                SaveOutcome::saved(path)
            }
            Err(e) => {
                error!("Failed to encode {}: {}", path.display(), e);
                SaveOutcome::failed(Some(path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_png_into_album() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("gallery"));
        let img = FrameImage::from_rgba(3, 2, vec![200; 24]).unwrap();

        let outcome = store.save(&img, "Burst", "Frame_0_test.png");
        assert!(outcome.permission_granted);
        assert!(outcome.success);

        let path = outcome.path.unwrap();
        assert_eq!(path, dir.path().join("gallery/Burst/Frame_0_test.png"));
        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(2, 1).0, [200, 200, 200, 200]);
    }

    #[test]
    fn root_under_a_file_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let store = GalleryStore::new(blocker.join("gallery"));
        assert!(!store.has_permission());

        let img = FrameImage::from_rgba(1, 1, vec![0; 4]).unwrap();
        assert_eq!(store.save(&img, "Burst", "a.png"), SaveOutcome::denied());
    }
}
