pub mod ffmpeg_reader;

use anyhow::Result;
use image::RgbaImage;
use std::path::Path;

/// Container-level facts about a source video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProbe {
    pub duration_sec: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Pulls still frames out of one opened video.
pub trait FrameSource: Send {
    fn probe(&self) -> Result<VideoProbe>;

    /// Frame shown at `timestamp_sec`, as full-resolution RGBA.
    fn extract(&mut self, timestamp_sec: f64) -> Result<RgbaImage>;
}

/// Opens videos; shared by every job in the process.
pub trait VideoOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}
