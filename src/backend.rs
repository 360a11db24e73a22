// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode backends.
//!
//! A backend is the external decoder the bridge forwards work to: a VA-API driver or a VDPAU
//! implementation. This module contains the interface all backends implement, and the types
//! exchanged over it. Backends hand out plain integer handles for their decoders and surfaces
//! and keep the actual objects to themselves.

#[cfg(test)]
pub(crate) mod dummy;
#[cfg(feature = "vaapi")]
pub mod vaapi;
#[cfg(feature = "vdpau")]
pub mod vdpau;

use std::fmt;
use std::os::fd::OwnedFd;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::device::DmaBufImport;
use crate::translate::BackendPictureParams;
use crate::translate::SliceBuffer;
use crate::BridgeError;
use crate::Fourcc;
use crate::Resolution;

/// The family of external decoder the bridge talks to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    VaApi,
    Vdpau,
}

impl FromStr for Backend {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vaapi" | "va-api" | "VAAPI" => Ok(Backend::VaApi),
            "vdpau" | "VDPAU" => Ok(Backend::Vdpau),
            _ => Err("unrecognized backend. Valid values: vaapi, vdpau"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::VaApi => "VA-API",
            Backend::Vdpau => "VDPAU",
        })
    }
}

/// Handle to a decoded-picture surface owned by a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

/// Handle to a decoder instance owned by a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecoderId(pub u32);

/// Decoder profiles the backends can be asked for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderProfile {
    H264ConstrainedBaseline,
    H264Baseline,
    H264Main,
    H264High,
}

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend is out of resources")]
    OutOfResources,
    #[error("operation not supported by the backend: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type BackendResult<T> = Result<T, BackendError>;

impl From<BackendError> for BridgeError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::OutOfResources => BridgeError::OutOfHostMemory,
            BackendError::Unsupported(what) => BridgeError::FeatureNotPresent(what),
            BackendError::Other(e) => BridgeError::Unknown(e),
        }
    }
}

/// Position of one plane inside a [`LinearFrame`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneInfo {
    pub offset: usize,
    pub pitch: usize,
}

/// A decoded NV12 picture read back to system memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinearFrame {
    pub data: Vec<u8>,
    pub extent: Resolution,
    /// Y then UV.
    pub planes: [PlaneInfo; 2],
}

impl LinearFrame {
    /// Returns the bytes of plane `index`, up to the start of the next plane.
    pub fn plane(&self, index: usize) -> &[u8] {
        let start = self.planes[index].offset.min(self.data.len());
        let end = self
            .planes
            .get(index + 1)
            .map(|next| next.offset)
            .filter(|&end| end >= start)
            .unwrap_or(self.data.len())
            .min(self.data.len());

        &self.data[start..end]
    }
}

/// A surface exported as a DMA-buf.
#[derive(Debug)]
pub struct ExportedSurface {
    pub fd: OwnedFd,
    pub width: u32,
    pub height: u32,
    pub fourcc: Fourcc,
    pub num_planes: u32,
    pub pitches: [u32; 3],
    pub offsets: [u32; 3],
    pub modifier: u64,
}

/// Interface to an external decoder.
///
/// All methods are called with the device lock held, so implementations do not need to be
/// reentrant.
pub trait DecoderBackend {
    /// Which family this backend belongs to. Decides the shape of the parameters passed to
    /// [`DecoderBackend::render`].
    fn kind(&self) -> Backend;

    /// Creates a decoder for pictures up to `extent`.
    fn create_decoder(
        &mut self,
        profile: DecoderProfile,
        extent: Resolution,
        max_references: u32,
    ) -> BackendResult<DecoderId>;

    fn destroy_decoder(&mut self, decoder: DecoderId);

    /// Creates a NV12 surface of `extent`.
    fn create_surface(&mut self, extent: Resolution) -> BackendResult<SurfaceId>;

    /// Whether [`DecoderBackend::import_surface`] can succeed at all.
    fn supports_surface_import(&self) -> bool {
        false
    }

    /// Wraps the memory of `dmabuf` in a NV12 surface of `extent`, so pictures are decoded
    /// straight into it.
    fn import_surface(
        &mut self,
        extent: Resolution,
        dmabuf: DmaBufImport,
    ) -> BackendResult<SurfaceId> {
        let _ = (extent, dmabuf);
        Err(BackendError::Unsupported("surface import"))
    }

    fn destroy_surface(&mut self, surface: SurfaceId);

    /// Submits the decode of one picture into `target`. May return before decoding completes.
    fn render(
        &mut self,
        decoder: DecoderId,
        target: SurfaceId,
        picture: &BackendPictureParams,
        slices: &[SliceBuffer],
    ) -> BackendResult<()>;

    /// Blocks until all pending work on `surface` has completed.
    fn sync(&mut self, surface: SurfaceId) -> BackendResult<()>;

    /// Reads the content of `surface` back as linear NV12.
    fn read_surface(&mut self, surface: SurfaceId, extent: Resolution)
        -> BackendResult<LinearFrame>;

    /// Exports `surface` as a DMA-buf for zero-copy sharing.
    fn export_dmabuf(&mut self, _surface: SurfaceId) -> BackendResult<ExportedSurface> {
        Err(BackendError::Unsupported("dma-buf export"))
    }
}

/// A backend shared by all the sessions of a device. The mutex is the device lock.
pub type SharedBackend = Arc<Mutex<Box<dyn DecoderBackend + Send>>>;
