// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Vulkan Video H.264 decode bridge for legacy Intel hardware.
//!
//! Gen7/7.5/8 GPUs cannot run the Vulkan Video decode pipeline natively, so decode commands
//! recorded by the application are captured at record time and replayed against a mature
//! external decoder ([VDPAU](crate::backend::vdpau) or [VA-API](crate::backend::vaapi)) at
//! queue submission time. The decoded pictures are then written back into the Vulkan images,
//! either through a zero-copy DMA-buf import or through a CPU copy that re-tiles the pixels.
//!
//! The main entry points are:
//!
//! * [`session::BridgeContext`] and [`session::create_session`] to set up decoding,
//! * [`deferred::CommandBuffer`] together with [`deferred::decode_frame`] to record work,
//! * [`deferred::execute_deferred`] to run it at submission time.

pub mod backend;
pub mod caps;
pub mod codec;
pub mod config;
pub mod cross_device;
pub mod deferred;
pub mod device;
pub mod image_processing;
pub mod session;
pub mod surface_cache;
pub mod translate;
pub mod utils;

use std::fmt;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use thiserror::Error;

#[cfg(feature = "vaapi")]
pub use libva;

pub use backend::Backend;
pub use config::BridgeConfig;
pub use device::ImageId;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Size of the resolution in 16x16 macroblocks, rounding up.
    pub fn in_macroblocks(&self) -> Self {
        Self {
            width: self.width.div_ceil(16),
            height: self.height.div_ceil(16),
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A FOURCC code, stored in the little-endian order used by DRM and VA-API.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const NV12: Fourcc = Fourcc::from_bytes(b"NV12");

    pub const fn from_bytes(code: &[u8; 4]) -> Self {
        Self(
            code[0] as u32 | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24,
        )
    }
}

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, self.0);
        let c: Vec<char> = buf
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        write!(f, "{}{}{}{}", c[0], c[1], c[2], c[3])
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x} ({})", self.0, self)
    }
}

/// Status reported back to the Vulkan layer.
///
/// Each variant corresponds to the `VkResult` the driver returns to the application for the
/// failing entry point.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("backend initialization failed: {0}")]
    InitializationFailed(String),
    #[error("feature not present: {0}")]
    FeatureNotPresent(&'static str),
    #[error("format not supported: {0}")]
    FormatNotSupported(String),
    #[error("video profile operation not supported")]
    VideoProfileOperationNotSupported,
    #[error("video picture layout not supported: {0}")]
    VideoPictureLayoutNotSupported(String),
    #[error("too many objects: {0}")]
    TooManyObjects(String),
    #[error("memory map failed: {0}")]
    MemoryMapFailed(String),
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("invalid command buffer state: {0}")]
    InvalidState(&'static str),
    #[error("unknown error: {0:#}")]
    Unknown(anyhow::Error),
}

/// Result type returned by the bridge entry points.
pub type BridgeResult<T> = Result<T, BridgeError>;
