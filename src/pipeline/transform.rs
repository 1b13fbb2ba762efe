use crate::capture::FrameImage;

/// Quarter-turn rotation. A `w x h` image becomes `h x w`; the source pixel
/// at `(x, y)` lands at destination index `(w - x - 1) * h + y`.
pub fn rotate_quarter_turn(image: &FrameImage) -> FrameImage {
    const C: usize = FrameImage::CHANNELS;
    let w = image.width() as usize;
    let h = image.height() as usize;
    let src = image.as_bytes();
    let mut dst = vec![0u8; src.len()];

    for y in 0..h {
        for x in 0..w {
            let from = (y * w + x) * C;
            let to = ((w - x - 1) * h + y) * C;
            dst[to..to + C].copy_from_slice(&src[from..from + C]);
        }
    }

    // Same byte count, so the invariant carries over
    FrameImage::from_rgba_unchecked(image.height(), image.width(), dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Image whose red/green channels encode the source pixel index.
    fn marked(w: u32, h: u32) -> FrameImage {
        let data = (0..w * h)
            .flat_map(|i| [(i & 0xff) as u8, (i >> 8) as u8, 0, 255])
            .collect();
        FrameImage::from_rgba(w, h, data).unwrap()
    }

    fn marker(px: [u8; 4]) -> u32 {
        px[0] as u32 | (px[1] as u32) << 8
    }

    #[test]
    fn two_by_three_by_hand() {
        let rotated = rotate_quarter_turn(&marked(2, 3));
        assert_eq!((rotated.width(), rotated.height()), (3, 2));

        let markers: Vec<u32> = rotated
            .as_bytes()
            .chunks_exact(4)
            .map(|px| marker([px[0], px[1], px[2], px[3]]))
            .collect();
        // Source indices y*2+x placed at (2-x-1)*3+y
        assert_eq!(markers, vec![1, 3, 5, 0, 2, 4]);
    }

    #[test]
    fn every_pixel_lands_exactly_once() {
        for (w, h) in [(1, 1), (1, 7), (5, 1), (16, 9), (33, 20)] {
            let rotated = rotate_quarter_turn(&marked(w, h));
            assert_eq!((rotated.width(), rotated.height()), (h, w));

            let mut seen = HashSet::new();
            for y in 0..h {
                for x in 0..w {
                    let dst = ((w - x - 1) * h + y) as usize;
                    let px = &rotated.as_bytes()[dst * 4..dst * 4 + 4];
                    assert_eq!(marker([px[0], px[1], px[2], px[3]]), y * w + x);
                    assert!(seen.insert(dst));
                }
            }
            assert_eq!(seen.len(), (w * h) as usize);
        }
    }

    #[test]
    fn empty_image_stays_empty() {
        let empty = FrameImage::from_rgba(0, 4, Vec::new()).unwrap();
        let rotated = rotate_quarter_turn(&empty);
        assert_eq!((rotated.width(), rotated.height()), (4, 0));
        assert!(rotated.as_bytes().is_empty());
    }

    #[test]
    fn four_turns_restore_the_original() {
        let original = marked(6, 4);
        let mut image = original.clone();
        for _ in 0..4 {
            image = rotate_quarter_turn(&image);
        }
        assert_eq!(image, original);
    }
}
