// Sprite index artifact definitions
//
// This module contains the struct definitions for the JSON index persisted
// next to the sprite sheet in a job's output directory. Game engines read
// this file, so field names and ordering are a versioned contract.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const INDEX_VERSION: &str = "1.0";
pub const SPRITE_FILE: &str = "sprite.png";
pub const INDEX_FILE: &str = "index.json";

/// Width/height pair in pixels
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

/// One tile on the sheet: its placement and the source timestamp (ms precision)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct IndexFrame {
    pub i: usize,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub t: f64,
}

/// Index as written to index.json
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SpriteIndex {
    pub version: String,
    pub frame_size: Size,
    pub sheet_size: Size,
    pub frames: Vec<IndexFrame>,
}

/// Round a timestamp to 3 decimals.
pub fn round_millis(t: f64) -> f64 {
    (t * 1000.0).round() / 1000.0
}

impl SpriteIndex {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write index to {}", path.display()))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read index at {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }
}
