// Job parameters: the knob set submitted alongside a video.
//
// Parsed once at submission and never mutated afterwards; every numeric
// field is range-checked before a job record is created.

use crate::pipeline::error::ValidationError;
use serde::{Deserialize, Serialize};

/// Largest accepted tile edge in pixels
pub const MAX_TILE_EDGE: u32 = 4096;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameRange {
    #[serde(default)]
    pub start_sec: f64,
    #[serde(default)]
    pub end_sec: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    pub w: u32,
    pub h: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    #[default]
    #[serde(alias = "fixed-columns")]
    FixedColumns,
    #[serde(alias = "auto-square")]
    AutoSquare,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CropMode {
    None,
    #[default]
    #[serde(alias = "tight-bbox")]
    TightBbox,
    #[serde(alias = "safe-bbox")]
    SafeBbox,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct JobParams {
    pub fps: u32,
    pub frame_range: FrameRange,
    pub max_frames: u32,
    pub target_size: TargetSize,
    /// "#RRGGBB" or "transparent"
    pub bg_color: String,
    pub transparent: bool,
    pub padding: u32,
    pub spacing: u32,
    pub layout_mode: LayoutMode,
    /// Only consulted in fixed-columns mode
    pub columns: u32,
    pub matte_strength: f32,
    pub crop_mode: CropMode,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            fps: 12,
            frame_range: FrameRange::default(),
            max_frames: 300,
            target_size: TargetSize { w: 256, h: 256 },
            bg_color: "transparent".to_string(),
            transparent: true,
            padding: 4,
            spacing: 4,
            layout_mode: LayoutMode::FixedColumns,
            columns: 12,
            matte_strength: 0.6,
            crop_mode: CropMode::TightBbox,
        }
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ValidationError::out_of_range(field, min, max, value))
    }
}

impl JobParams {
    /// Parse a JSON params document (missing fields take defaults) and validate it.
    pub fn from_json(raw: &str) -> Result<Self, ValidationError> {
        let raw = if raw.trim().is_empty() { "{}" } else { raw };
        let params: JobParams =
            serde_json::from_str(raw).map_err(|e| ValidationError::malformed(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("fps", self.fps as f64, 1.0, 60.0)?;
        check_range("max_frames", self.max_frames as f64, 1.0, 2000.0)?;
        check_range("target_size.w", self.target_size.w as f64, 1.0, MAX_TILE_EDGE as f64)?;
        check_range("target_size.h", self.target_size.h as f64, 1.0, MAX_TILE_EDGE as f64)?;
        check_range("padding", self.padding as f64, 0.0, 64.0)?;
        check_range("spacing", self.spacing as f64, 0.0, 64.0)?;
        check_range("columns", self.columns as f64, 1.0, 64.0)?;
        check_range("matte_strength", self.matte_strength as f64, 0.0, 1.0)?;

        if !self.frame_range.start_sec.is_finite() {
            return Err(ValidationError::malformed("frame_range.start_sec must be finite"));
        }
        if let Some(end) = self.frame_range.end_sec {
            if !end.is_finite() {
                return Err(ValidationError::malformed("frame_range.end_sec must be finite"));
            }
        }

        // The scaled subject must fit inside the padded tile.
        let inner = self.padding * 2;
        if self.target_size.w <= inner || self.target_size.h <= inner {
            return Err(ValidationError::malformed(format!(
                "target_size {}x{} leaves no room inside padding {}",
                self.target_size.w, self.target_size.h, self.padding
            )));
        }

        Ok(())
    }

    /// Column count to honor, if the layout mode uses one.
    pub fn fixed_columns(&self) -> Option<u32> {
        match self.layout_mode {
            LayoutMode::FixedColumns if self.columns > 0 => Some(self.columns),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let params = JobParams::from_json("{}").unwrap();
        assert_eq!(params, JobParams::default());
        assert_eq!(JobParams::from_json("  ").unwrap(), JobParams::default());
    }

    #[test]
    fn test_partial_document_merges_with_defaults() {
        let params = JobParams::from_json(
            r#"{"fps": 24, "layout_mode": "auto_square", "crop_mode": "safe_bbox",
                "frame_range": {"start_sec": 1.5, "end_sec": 3.0}}"#,
        )
        .unwrap();
        assert_eq!(params.fps, 24);
        assert_eq!(params.layout_mode, LayoutMode::AutoSquare);
        assert_eq!(params.crop_mode, CropMode::SafeBbox);
        assert_eq!(params.frame_range.end_sec, Some(3.0));
        assert_eq!(params.max_frames, 300);
        assert_eq!(params.fixed_columns(), None);
    }

    #[test]
    fn test_hyphenated_aliases() {
        let params =
            JobParams::from_json(r#"{"layout_mode": "fixed-columns", "crop_mode": "tight-bbox"}"#)
                .unwrap();
        assert_eq!(params.layout_mode, LayoutMode::FixedColumns);
        assert_eq!(params.crop_mode, CropMode::TightBbox);
        assert_eq!(params.fixed_columns(), Some(12));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for raw in [
            r#"{"fps": 0}"#,
            r#"{"fps": 61}"#,
            r#"{"max_frames": 2001}"#,
            r#"{"padding": 65}"#,
            r#"{"spacing": 100}"#,
            r#"{"columns": 0}"#,
            r#"{"matte_strength": 1.5}"#,
            r#"{"target_size": {"w": 0, "h": 10}}"#,
        ] {
            let err = JobParams::from_json(raw).unwrap_err();
            assert!(
                matches!(err, ValidationError::OutOfRange { .. }),
                "{raw} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_malformed_documents_rejected() {
        assert!(matches!(
            JobParams::from_json(r#"{"fps": -3}"#),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            JobParams::from_json(r#"{"layout_mode": "spiral"}"#),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            JobParams::from_json("not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_padding_must_leave_room() {
        let err =
            JobParams::from_json(r#"{"target_size": {"w": 8, "h": 64}, "padding": 4}"#).unwrap_err();
        assert!(err.to_string().contains("no room"));
    }
}
