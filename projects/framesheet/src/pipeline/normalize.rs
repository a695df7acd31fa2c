// Frame normalizer: crop the matted frame to its subject, scale it into the
// padded tile and center it on a fixed-size canvas.

use crate::pipeline::params::{CropMode, JobParams};
use image::{imageops, Rgba, RgbaImage};

/// Half-open pixel rectangle [x1, x2) x [y1, y2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    /// Grow by `margin` on every side, clamped to a `width` x `height` image.
    fn expand(&self, margin: u32, width: u32, height: u32) -> Self {
        Self {
            x1: self.x1.saturating_sub(margin),
            y1: self.y1.saturating_sub(margin),
            x2: self.x2.saturating_add(margin).min(width),
            y2: self.y2.saturating_add(margin).min(height),
        }
    }
}

/// Smallest rectangle containing every pixel with non-zero alpha.
pub fn alpha_bbox(img: &RgbaImage) -> Option<PixelRect> {
    let mut bbox: Option<PixelRect> = None;
    for (x, y, px) in img.enumerate_pixels() {
        if px[3] == 0 {
            continue;
        }
        bbox = Some(match bbox {
            None => PixelRect {
                x1: x,
                y1: y,
                x2: x + 1,
                y2: y + 1,
            },
            Some(b) => PixelRect {
                x1: b.x1.min(x),
                y1: b.y1.min(y),
                x2: b.x2.max(x + 1),
                y2: b.y2.max(y + 1),
            },
        });
    }
    bbox
}

/// "#RRGGBB" -> opaque color; "transparent", empty or anything malformed -> clear.
pub fn parse_bg_color(s: &str) -> Rgba<u8> {
    const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);
    let s = s.trim();
    if s.is_empty() || s == "transparent" {
        return CLEAR;
    }
    let hex = s.trim_start_matches('#');
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return CLEAR;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0);
    Rgba([channel(0), channel(2), channel(4), 255])
}

/// Aspect-preserving size that fits within (max_w, max_h); never enlarges.
pub fn fit_within(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let scale = f64::min(max_w as f64 / w as f64, max_h as f64 / h as f64);
    let nw = ((w as f64 * scale).round() as u32).clamp(1, max_w.max(1));
    let nh = ((h as f64 * scale).round() as u32).clamp(1, max_h.max(1));
    (nw, nh)
}

/// Per-job normalization policy, resolved once from the job params.
#[derive(Debug, Clone)]
pub struct FrameNormalizer {
    target_w: u32,
    target_h: u32,
    padding: u32,
    crop_mode: CropMode,
    background: Rgba<u8>,
}

impl FrameNormalizer {
    pub fn new(params: &JobParams) -> Self {
        let background = if params.transparent {
            Rgba([0, 0, 0, 0])
        } else {
            parse_bg_color(&params.bg_color)
        };
        Self {
            target_w: params.target_size.w,
            target_h: params.target_size.h,
            padding: params.padding,
            crop_mode: params.crop_mode,
            background,
        }
    }

    /// Crop region for a matted frame, or None when the frame is used whole.
    pub fn crop_region(&self, matted: &RgbaImage) -> Option<PixelRect> {
        let margin = match self.crop_mode {
            CropMode::None => return None,
            CropMode::TightBbox => 0,
            CropMode::SafeBbox => self.padding,
        };
        let (w, h) = matted.dimensions();
        alpha_bbox(matted).map(|b| b.expand(margin, w, h))
    }

    /// Normalize one matted frame (RGB plus alpha matte) into a target-size tile.
    pub fn normalize(&self, matted: &RgbaImage) -> RgbaImage {
        let subject = match self.crop_region(matted) {
            Some(r) => imageops::crop_imm(matted, r.x1, r.y1, r.width(), r.height()).to_image(),
            None => matted.clone(),
        };

        let max_w = self.target_w.saturating_sub(self.padding * 2).max(1);
        let max_h = self.target_h.saturating_sub(self.padding * 2).max(1);
        let (sw, sh) = fit_within(subject.width(), subject.height(), max_w, max_h);
        let scaled = if (sw, sh) == subject.dimensions() {
            subject
        } else {
            imageops::resize(&subject, sw, sh, imageops::FilterType::Lanczos3)
        };

        let mut canvas = RgbaImage::from_pixel(self.target_w, self.target_h, self.background);
        let x = (self.target_w.saturating_sub(sw)) / 2;
        let y = (self.target_h.saturating_sub(sh)) / 2;
        imageops::overlay(&mut canvas, &scaled, x as i64, y as i64);
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::params::TargetSize;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    /// Transparent image with an opaque red block at [x, x+bw) x [y, y+bh).
    fn subject(w: u32, h: u32, x: u32, y: u32, bw: u32, bh: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |px, py| {
            if px >= x && px < x + bw && py >= y && py < y + bh {
                RED
            } else {
                Rgba([0, 0, 0, 0])
            }
        })
    }

    fn params(w: u32, h: u32, padding: u32, crop_mode: CropMode) -> JobParams {
        JobParams {
            target_size: TargetSize { w, h },
            padding,
            crop_mode,
            ..JobParams::default()
        }
    }

    #[test]
    fn test_alpha_bbox() {
        let img = subject(20, 10, 3, 2, 5, 4);
        assert_eq!(
            alpha_bbox(&img),
            Some(PixelRect {
                x1: 3,
                y1: 2,
                x2: 8,
                y2: 6
            })
        );
        assert_eq!(alpha_bbox(&RgbaImage::new(4, 4)), None);
    }

    #[test]
    fn test_parse_bg_color() {
        assert_eq!(parse_bg_color("#FF8800"), Rgba([255, 136, 0, 255]));
        assert_eq!(parse_bg_color("00ff00"), Rgba([0, 255, 0, 255]));
        assert_eq!(parse_bg_color("transparent"), Rgba([0, 0, 0, 0]));
        assert_eq!(parse_bg_color(""), Rgba([0, 0, 0, 0]));
        assert_eq!(parse_bg_color("#FFF"), Rgba([0, 0, 0, 0]));
        assert_eq!(parse_bg_color("#GGGGGG"), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_fit_within_never_upscales() {
        assert_eq!(fit_within(10, 10, 100, 100), (10, 10));
        assert_eq!(fit_within(200, 100, 100, 100), (100, 50));
        assert_eq!(fit_within(100, 400, 100, 100), (25, 100));
        assert_eq!(fit_within(1000, 1, 10, 10), (10, 1));
    }

    #[test]
    fn test_output_always_target_size() {
        let inputs = [
            subject(640, 360, 100, 50, 200, 250),
            subject(90, 1600, 10, 10, 50, 1500),
            subject(7, 7, 0, 0, 7, 7),
            RgbaImage::new(300, 200),
            subject(1, 1, 0, 0, 1, 1),
        ];
        for mode in [CropMode::None, CropMode::TightBbox, CropMode::SafeBbox] {
            for (tw, th, pad) in [(256, 256, 4), (64, 32, 0), (33, 17, 8)] {
                let normalizer = FrameNormalizer::new(&params(tw, th, pad, mode));
                for img in &inputs {
                    assert_eq!(normalizer.normalize(img).dimensions(), (tw, th));
                }
            }
        }
    }

    #[test]
    fn test_tight_crop_scales_and_centers() {
        // 40x20 block, tile 24x24 with padding 2 -> fits into 20x20 as 20x10
        let img = subject(100, 100, 30, 30, 40, 20);
        let normalizer = FrameNormalizer::new(&params(24, 24, 2, CropMode::TightBbox));
        let tile = normalizer.normalize(&img);

        let bbox = alpha_bbox(&tile).unwrap();
        assert_eq!((bbox.width(), bbox.height()), (20, 10));
        assert_eq!((bbox.x1, bbox.y1), (2, 7));
    }

    #[test]
    fn test_safe_crop_keeps_margin_and_clamps() {
        let img = subject(50, 50, 1, 20, 10, 10);
        let normalizer = FrameNormalizer::new(&params(64, 64, 5, CropMode::SafeBbox));
        assert_eq!(
            normalizer.crop_region(&img),
            Some(PixelRect {
                x1: 0,
                y1: 15,
                x2: 16,
                y2: 35
            })
        );
    }

    #[test]
    fn test_no_subject_skips_crop() {
        let img = RgbaImage::new(30, 10);
        let normalizer = FrameNormalizer::new(&params(16, 16, 0, CropMode::TightBbox));
        assert_eq!(normalizer.crop_region(&img), None);
        assert_eq!(normalizer.normalize(&img).dimensions(), (16, 16));
    }

    #[test]
    fn test_background_fill() {
        let img = subject(4, 4, 1, 1, 2, 2);
        let mut p = params(16, 16, 0, CropMode::TightBbox);
        p.transparent = false;
        p.bg_color = "#0000FF".to_string();
        let tile = FrameNormalizer::new(&p).normalize(&img);
        assert_eq!(*tile.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
        // 2x2 subject is not upscaled: centered at (7, 7)
        assert_eq!(*tile.get_pixel(7, 7), RED);
        assert_eq!(*tile.get_pixel(6, 7), Rgba([0, 0, 255, 255]));

        p.transparent = true;
        let tile = FrameNormalizer::new(&p).normalize(&img);
        assert_eq!(tile.get_pixel(0, 0)[3], 0);
    }

    #[test]
    fn test_malformed_bg_degrades_to_transparent() {
        let mut p = params(8, 8, 0, CropMode::None);
        p.transparent = false;
        p.bg_color = "blue-ish".to_string();
        let tile = FrameNormalizer::new(&p).normalize(&RgbaImage::new(2, 2));
        assert_eq!(tile.get_pixel(0, 0)[3], 0);
    }
}
