// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runtime configuration of the bridge.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::Backend;
use crate::image_processing::SwizzleMode;

/// Overrides the bit-6 swizzling of the device: 0 for none, 1 for bit 9, 3 for bits 9 and 10.
pub const SWIZZLE_ENV: &str = "INTEL_HASVK_VIDEO_SWIZZLE";
/// When set to a non-zero value, decoded pictures are written to tiled images as if they
/// were linear.
pub const LINEAR_ENV: &str = "INTEL_HASVK_VIDEO_LINEAR";
/// Disables the DMA-buf path, all pictures go through the CPU.
pub const NO_DMABUF_ENV: &str = "HASVK_VIDEO_NO_DMABUF";
/// DRM render node used to open the VA-API display.
pub const DRM_DEVICE_ENV: &str = "HASVK_VIDEO_DRM_DEVICE";
/// Backend to use, `vaapi` or `vdpau`.
pub const BACKEND_ENV: &str = "HASVK_VIDEO_BACKEND";
/// Pitch of VDPAU surface readbacks: 0 for 2048-byte aligned, 1 for 128-byte aligned, 2 for
/// the surface width.
pub const PITCH_ENV: &str = "INTEL_HASVK_VIDEO_PITCH";

pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Row pitch of the buffers VDPAU surfaces are read back into.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ReadbackPitch {
    /// Aligned to 2048 bytes, and at least 2048. Some drivers write past smaller rows.
    #[default]
    Generous,
    /// Aligned to the 128 bytes of a Y tile row.
    TileRow,
    /// The surface width.
    Exact,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    pub backend: Backend,
    /// Number of surfaces cached per session. Defaults to the number of DPB slots plus one.
    pub cache_capacity: Option<usize>,
    /// Maximum number of decodes kept per command buffer. When reached, the oldest recorded
    /// decode is dropped.
    pub max_frames_per_submit: Option<NonZeroUsize>,
    pub swizzle_override: Option<SwizzleMode>,
    pub force_linear_copy: bool,
    /// Try to share decoded pictures through DMA-buf before falling back to a CPU copy.
    pub cross_device: bool,
    /// How long to wait for the bitstream producer before decoding anyway.
    pub fence_timeout: Duration,
    pub drm_device: Option<PathBuf>,
    pub readback_pitch: ReadbackPitch,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "vdpau") {
                Backend::Vdpau
            } else {
                Backend::VaApi
            },
            cache_capacity: None,
            max_frames_per_submit: None,
            swizzle_override: None,
            force_linear_copy: false,
            cross_device: true,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            drm_device: None,
            readback_pitch: ReadbackPitch::default(),
        }
    }
}

fn parse_swizzle(value: &str) -> Option<SwizzleMode> {
    match value.trim().parse::<u32>() {
        Ok(0) => Some(SwizzleMode::None),
        Ok(1) => Some(SwizzleMode::Bit9),
        Ok(3) => Some(SwizzleMode::Bit9Bit10),
        _ => None,
    }
}

fn parse_pitch(value: &str) -> Option<ReadbackPitch> {
    match value.trim().parse::<u32>() {
        Ok(0) => Some(ReadbackPitch::Generous),
        Ok(1) => Some(ReadbackPitch::TileRow),
        Ok(2) => Some(ReadbackPitch::Exact),
        _ => None,
    }
}

fn parse_flag(value: &str) -> bool {
    value.trim().parse::<u32>().is_ok_and(|v| v != 0)
}

impl BridgeConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from variables returned by `var`, defaults filling the gaps.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(backend) = var(BACKEND_ENV) {
            match backend.parse() {
                Ok(backend) => config.backend = backend,
                Err(e) => log::warn!("ignoring {}={}: {}", BACKEND_ENV, backend, e),
            }
        }

        config.swizzle_override = var(SWIZZLE_ENV).as_deref().and_then(parse_swizzle);
        config.force_linear_copy = var(LINEAR_ENV).as_deref().is_some_and(parse_flag);
        config.cross_device = !var(NO_DMABUF_ENV).as_deref().is_some_and(parse_flag);
        config.drm_device = var(DRM_DEVICE_ENV).map(PathBuf::from);

        if let Some(pitch) = var(PITCH_ENV) {
            match parse_pitch(&pitch) {
                Some(pitch) => config.readback_pitch = pitch,
                None => log::warn!("ignoring {}={}", PITCH_ENV, pitch),
            }
        }

        config
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    pub fn max_frames_per_submit(mut self, max: NonZeroUsize) -> Self {
        self.max_frames_per_submit = Some(max);
        self
    }

    pub fn swizzle_override(mut self, swizzle: SwizzleMode) -> Self {
        self.swizzle_override = Some(swizzle);
        self
    }

    pub fn force_linear_copy(mut self, force: bool) -> Self {
        self.force_linear_copy = force;
        self
    }

    pub fn cross_device(mut self, enabled: bool) -> Self {
        self.cross_device = enabled;
        self
    }

    pub fn fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn readback_pitch(mut self, pitch: ReadbackPitch) -> Self {
        self.readback_pitch = pitch;
        self
    }
}
