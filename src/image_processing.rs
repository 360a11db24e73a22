// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel layout conversion between linear buffers and Intel Y-tiled surfaces.
//!
//! A Y tile is 128 bytes wide and 32 rows high (4096 bytes). Inside a tile the data is stored
//! column-major in 16-byte OWord columns: each column holds the 16 bytes of all 32 rows before
//! the next column starts. Tiles themselves are laid out row-major, `pitch / 128` per row.
//!
//! Some memory controller configurations additionally swizzle bit 6 of the address, see
//! [`SwizzleMode`]. The swizzle is a property of the device and cannot be recovered from the
//! surface itself.

use thiserror::Error;

pub const Y_TILE_WIDTH: usize = 128;
pub const Y_TILE_HEIGHT: usize = 32;
pub const Y_TILE_SIZE: usize = Y_TILE_WIDTH * Y_TILE_HEIGHT;
const OWORD_SIZE: usize = 16;
const OWORD_COLUMN_SIZE: usize = OWORD_SIZE * Y_TILE_HEIGHT;

/// Bit-6 address swizzling applied by the memory controller.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SwizzleMode {
    #[default]
    None,
    /// Bit 6 is XORed with bit 9 (`I915_BIT_6_SWIZZLE_9`).
    Bit9,
    /// Bit 6 is XORed with bits 9 and 10 (`I915_BIT_6_SWIZZLE_9_10`).
    Bit9Bit10,
}

impl SwizzleMode {
    fn apply(self, tile_offset: usize) -> usize {
        let flip = match self {
            SwizzleMode::None => 0,
            SwizzleMode::Bit9 => (tile_offset >> 9) & 1,
            SwizzleMode::Bit9Bit10 => ((tile_offset >> 9) ^ (tile_offset >> 10)) & 1,
        };

        tile_offset ^ (flip << 6)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tiling {
    Linear,
    Y,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CopyDirection {
    LinearToTiled,
    TiledToLinear,
}

/// Layout of one plane of a surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub pitch: usize,
    pub tiling: Tiling,
}

impl PlaneLayout {
    pub fn linear(pitch: usize) -> Self {
        Self {
            pitch,
            tiling: Tiling::Linear,
        }
    }

    pub fn y_tiled(pitch: usize) -> Self {
        Self {
            pitch,
            tiling: Tiling::Y,
        }
    }

    /// Minimum number of bytes needed to hold `width`x`height` bytes in this layout.
    pub fn required_size(&self, width: usize, height: usize) -> usize {
        if width == 0 || height == 0 {
            return 0;
        }

        match self.tiling {
            Tiling::Linear => (height - 1) * self.pitch + width,
            Tiling::Y => tiled_plane_size(self.pitch, height),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TranscodeError {
    #[error("buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },
    #[error("pitch {pitch} cannot hold rows of {width} bytes")]
    PitchTooSmall { pitch: usize, width: usize },
}

fn tiles_per_row(pitch: usize) -> usize {
    (pitch / Y_TILE_WIDTH).max(1)
}

/// Size in bytes of a Y-tiled plane of `height` rows with `pitch`, padded to whole tile rows.
pub fn tiled_plane_size(pitch: usize, height: usize) -> usize {
    height.div_ceil(Y_TILE_HEIGHT) * tiles_per_row(pitch) * Y_TILE_SIZE
}

/// Returns the offset of byte `(x, y)` inside a Y-tiled plane with `tiles_per_row` tiles per
/// row of tiles.
fn y_tile_offset(x: usize, y: usize, tiles_per_row: usize, swizzle: SwizzleMode) -> usize {
    let tile_row = y / Y_TILE_HEIGHT;
    let tile_col = x / Y_TILE_WIDTH;
    let row_in_tile = y % Y_TILE_HEIGHT;
    let col_in_tile = x % Y_TILE_WIDTH;

    let oword = col_in_tile / OWORD_SIZE;
    let tile_offset = oword * OWORD_COLUMN_SIZE + row_in_tile * OWORD_SIZE + col_in_tile % OWORD_SIZE;
    let tile_base = tile_row * tiles_per_row * Y_TILE_SIZE + tile_col * Y_TILE_SIZE;

    tile_base + swizzle.apply(tile_offset)
}

fn check_len(buf_len: usize, needed: usize) -> Result<(), TranscodeError> {
    if buf_len < needed {
        Err(TranscodeError::BufferTooSmall {
            needed,
            actual: buf_len,
        })
    } else {
        Ok(())
    }
}

fn check_pitch(layout: &PlaneLayout, width: usize) -> Result<(), TranscodeError> {
    let usable = match layout.tiling {
        Tiling::Linear => layout.pitch,
        Tiling::Y => tiles_per_row(layout.pitch) * Y_TILE_WIDTH,
    };

    if usable < width {
        Err(TranscodeError::PitchTooSmall {
            pitch: layout.pitch,
            width,
        })
    } else {
        Ok(())
    }
}

/// Copies `width`x`height` bytes between a linear and a Y-tiled buffer.
///
/// `direction` tells which of `dst` and `src` is tiled. The tile grid is derived from the pitch
/// of the tiled side.
#[allow(clippy::too_many_arguments)]
pub fn tiled_copy(
    dst: &mut [u8],
    src: &[u8],
    width: usize,
    height: usize,
    dst_pitch: usize,
    src_pitch: usize,
    direction: CopyDirection,
    swizzle: SwizzleMode,
) -> Result<(), TranscodeError> {
    let (dst_layout, src_layout) = match direction {
        CopyDirection::LinearToTiled => {
            (PlaneLayout::y_tiled(dst_pitch), PlaneLayout::linear(src_pitch))
        }
        CopyDirection::TiledToLinear => {
            (PlaneLayout::linear(dst_pitch), PlaneLayout::y_tiled(src_pitch))
        }
    };

    check_pitch(&dst_layout, width)?;
    check_pitch(&src_layout, width)?;
    check_len(dst.len(), dst_layout.required_size(width, height))?;
    check_len(src.len(), src_layout.required_size(width, height))?;

    let tiles_per_row = match direction {
        CopyDirection::LinearToTiled => tiles_per_row(dst_pitch),
        CopyDirection::TiledToLinear => tiles_per_row(src_pitch),
    };

    for y in 0..height {
        // A 16-byte OWord run is contiguous in both layouts, and the swizzle only touches bit 6,
        // so we can move whole runs at once.
        for x in (0..width).step_by(OWORD_SIZE) {
            let len = OWORD_SIZE.min(width - x);
            let tiled = y_tile_offset(x, y, tiles_per_row, swizzle);

            match direction {
                CopyDirection::LinearToTiled => {
                    let linear = y * src_pitch + x;
                    dst[tiled..tiled + len].copy_from_slice(&src[linear..linear + len]);
                }
                CopyDirection::TiledToLinear => {
                    let linear = y * dst_pitch + x;
                    dst[linear..linear + len].copy_from_slice(&src[tiled..tiled + len]);
                }
            }
        }
    }

    Ok(())
}

/// Copies `height` rows of `width` bytes between two linear buffers.
///
/// If both pitches are equal the whole block is copied at once, otherwise row by row.
pub fn linear_copy(
    dst: &mut [u8],
    src: &[u8],
    width: usize,
    height: usize,
    dst_pitch: usize,
    src_pitch: usize,
) -> Result<(), TranscodeError> {
    check_pitch(&PlaneLayout::linear(dst_pitch), width)?;
    check_pitch(&PlaneLayout::linear(src_pitch), width)?;
    let dst_needed = PlaneLayout::linear(dst_pitch).required_size(width, height);
    let src_needed = PlaneLayout::linear(src_pitch).required_size(width, height);
    check_len(dst.len(), dst_needed)?;
    check_len(src.len(), src_needed)?;

    if dst_pitch == src_pitch {
        dst[..src_needed].copy_from_slice(&src[..src_needed]);
        return Ok(());
    }

    let src_lines = src.chunks(src_pitch).map(|line| &line[..width]);
    let dst_lines = dst.chunks_mut(dst_pitch);
    for (src_line, dst_line) in src_lines.zip(dst_lines).take(height) {
        dst_line[..width].copy_from_slice(src_line);
    }

    Ok(())
}

/// Moves one plane from `src` to `dst`, converting the layout as needed.
///
/// When both sides share pitch and tiling, `src` is copied in bulk: tile padding is part of
/// the data and must travel along with it. Tiled to tiled copies with different pitches go
/// through a linear intermediate buffer.
pub fn transcode_plane(
    dst: &mut [u8],
    dst_layout: PlaneLayout,
    src: &[u8],
    src_layout: PlaneLayout,
    width: usize,
    height: usize,
    swizzle: SwizzleMode,
) -> Result<(), TranscodeError> {
    if dst_layout == src_layout {
        check_len(dst.len(), src.len())?;
        dst[..src.len()].copy_from_slice(src);
        return Ok(());
    }

    match (src_layout.tiling, dst_layout.tiling) {
        (Tiling::Linear, Tiling::Linear) => {
            linear_copy(dst, src, width, height, dst_layout.pitch, src_layout.pitch)
        }
        (Tiling::Linear, Tiling::Y) => tiled_copy(
            dst,
            src,
            width,
            height,
            dst_layout.pitch,
            src_layout.pitch,
            CopyDirection::LinearToTiled,
            swizzle,
        ),
        (Tiling::Y, Tiling::Linear) => tiled_copy(
            dst,
            src,
            width,
            height,
            dst_layout.pitch,
            src_layout.pitch,
            CopyDirection::TiledToLinear,
            swizzle,
        ),
        (Tiling::Y, Tiling::Y) => {
            let linear_pitch = src_layout.pitch;
            let mut linear = vec![0u8; PlaneLayout::linear(linear_pitch).required_size(width, height)];
            tiled_copy(
                &mut linear,
                src,
                width,
                height,
                linear_pitch,
                src_layout.pitch,
                CopyDirection::TiledToLinear,
                swizzle,
            )?;
            tiled_copy(
                dst,
                &linear,
                width,
                height,
                dst_layout.pitch,
                linear_pitch,
                CopyDirection::LinearToTiled,
                swizzle,
            )
        }
    }
}

/// Copies a NV12 picture out of a driver buffer into `dst`, packing both planes with
/// `dst_pitch`.
///
/// `src_pitches` and `src_offsets` give the pitch and starting position of the Y and UV
/// planes in `src`. In `dst` the UV plane starts right after `height` rows of Y.
pub fn nv12_copy(
    dst: &mut [u8],
    dst_pitch: usize,
    src: &[u8],
    src_pitches: [usize; 2],
    src_offsets: [usize; 2],
    width: usize,
    height: usize,
) -> Result<(), TranscodeError> {
    let uv_height = height.div_ceil(2);
    let dst_uv_offset = dst_pitch * height;
    check_len(dst.len(), dst_uv_offset)?;

    let (dst_y, dst_uv) = dst.split_at_mut(dst_uv_offset);
    let plane = |index: usize| src.get(src_offsets[index]..).unwrap_or(&[]);

    linear_copy(dst_y, plane(0), width, height, dst_pitch, src_pitches[0])?;
    // Two interleaved samples per pair of pixels, so the UV rows are as wide as the Y rows.
    linear_copy(
        dst_uv,
        plane(1),
        width + width % 2,
        uv_height,
        dst_pitch,
        src_pitches[1],
    )
}

/// Gen7 sometimes reports plane offsets that are one byte short of their required alignment.
/// Returns the corrected offset.
pub fn fixup_plane_offset(offset: usize, alignment: usize) -> usize {
    if alignment > 1 && offset % alignment == alignment - 1 {
        offset + 1
    } else {
        offset
    }
}
