// Layout planner: deterministic row-major grid for a frame count and tile size.

use crate::pipeline::params::LayoutMode;
use serde::Serialize;

/// Grid derived from (frame count, tile size, spacing, mode). Never built by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayoutPlan {
    pub columns: u32,
    pub rows: u32,
    pub sheet_width: u32,
    pub sheet_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub spacing: u32,
}

/// Smallest c >= 1 with c * c >= n.
fn ceil_sqrt(n: usize) -> u32 {
    if n <= 1 {
        return 1;
    }
    let mut c = (n as f64).sqrt().ceil() as u64;
    while c * c < n as u64 {
        c += 1;
    }
    while c > 1 && (c - 1) * (c - 1) >= n as u64 {
        c -= 1;
    }
    c as u32
}

fn span(cells: u32, tile: u32, spacing: u32) -> u32 {
    cells
        .saturating_mul(tile.saturating_add(spacing))
        .saturating_sub(spacing)
}

impl LayoutPlan {
    pub fn plan(
        frame_count: usize,
        tile_width: u32,
        tile_height: u32,
        spacing: u32,
        mode: LayoutMode,
        columns: Option<u32>,
    ) -> Self {
        let columns = match (mode, columns) {
            (LayoutMode::FixedColumns, Some(c)) if c >= 1 => c,
            _ => ceil_sqrt(frame_count),
        };

        let rows = if frame_count == 0 {
            0
        } else {
            frame_count.div_ceil(columns as usize) as u32
        };

        Self {
            columns,
            rows,
            sheet_width: span(columns, tile_width, spacing),
            sheet_height: span(rows, tile_height, spacing),
            tile_width,
            tile_height,
            spacing,
        }
    }

    /// (column, row) of frame `index`.
    pub fn cell(&self, index: usize) -> (u32, u32) {
        let cols = self.columns as usize;
        ((index % cols) as u32, (index / cols) as u32)
    }

    /// Top-left pixel of frame `index` on the sheet.
    pub fn origin(&self, index: usize) -> (u32, u32) {
        let (col, row) = self.cell(index);
        (
            col * (self.tile_width + self.spacing),
            row * (self.tile_height + self.spacing),
        )
    }

    pub fn capacity(&self) -> usize {
        self.columns as usize * self.rows as usize
    }
}
