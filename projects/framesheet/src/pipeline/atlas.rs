// Atlas composer: pastes normalized tiles into the planned grid and builds the index.

use crate::artifacts::{round_millis, IndexFrame, Size, SpriteIndex, INDEX_VERSION};
use crate::pipeline::error::PipelineError;
use crate::pipeline::layout::LayoutPlan;
use anyhow::Result;
use image::{imageops, Rgba, RgbaImage};

pub struct ComposedSheet {
    pub image: RgbaImage,
    pub index: SpriteIndex,
}

/// Compose tiles (in sample order) onto a transparent sheet.
///
/// Tiles arrive through an iterator so callers can stream them from disk
/// one at a time; the composer itself performs no I/O.
pub fn compose<I>(
    tiles: I,
    timestamps: &[f64],
    layout: &LayoutPlan,
) -> Result<ComposedSheet, PipelineError>
where
    I: IntoIterator<Item = Result<RgbaImage>>,
{
    if layout.capacity() < timestamps.len() {
        return Err(PipelineError::Layout(format!(
            "{}x{} grid cannot hold {} frames",
            layout.columns,
            layout.rows,
            timestamps.len()
        )));
    }

    let mut sheet = RgbaImage::from_pixel(
        layout.sheet_width,
        layout.sheet_height,
        Rgba([0, 0, 0, 0]),
    );
    let mut frames = Vec::with_capacity(timestamps.len());

    let mut tiles = tiles.into_iter();
    for (i, &t) in timestamps.iter().enumerate() {
        let tile = tiles
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing tile for frame {}", i))??;

        if tile.dimensions() != (layout.tile_width, layout.tile_height) {
            return Err(PipelineError::Layout(format!(
                "tile {} is {}x{}, expected {}x{}",
                i,
                tile.width(),
                tile.height(),
                layout.tile_width,
                layout.tile_height
            )));
        }

        let (x, y) = layout.origin(i);
        imageops::overlay(&mut sheet, &tile, x as i64, y as i64);

        frames.push(IndexFrame {
            i,
            x,
            y,
            w: layout.tile_width,
            h: layout.tile_height,
            t: round_millis(t),
        });
    }

    let index = SpriteIndex {
        version: INDEX_VERSION.to_string(),
        frame_size: Size {
            w: layout.tile_width,
            h: layout.tile_height,
        },
        sheet_size: Size {
            w: layout.sheet_width,
            h: layout.sheet_height,
        },
        frames,
    };

    Ok(ComposedSheet {
        image: sheet,
        index,
    })
}
