// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the bridge run so we can
//! test it in isolation. It records every call it receives.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use super::Backend;
use super::BackendError;
use super::BackendResult;
use super::DecoderBackend;
use super::DecoderId;
use super::DecoderProfile;
use super::ExportedSurface;
use super::LinearFrame;
use super::PlaneInfo;
use super::SurfaceId;
use crate::device::DmaBufImport;
use crate::translate::BackendPictureParams;
use crate::translate::SliceBuffer;
use crate::utils::align_up;
use crate::Fourcc;
use crate::Resolution;

/// Calls received by a [`DummyBackend`].
#[derive(Debug, Default)]
pub(crate) struct Calls {
    pub created_decoders: Vec<(DecoderProfile, Resolution, u32)>,
    pub destroyed_decoders: Vec<DecoderId>,
    pub created_surfaces: Vec<SurfaceId>,
    pub destroyed_surfaces: Vec<SurfaceId>,
    /// Decoder, target and number of slices of each render.
    pub renders: Vec<(DecoderId, SurfaceId, usize)>,
    pub syncs: Vec<SurfaceId>,
    pub reads: Vec<SurfaceId>,
    pub exports: Vec<SurfaceId>,
    /// Imported surface and modifier of the imported buffer.
    pub imports: Vec<(SurfaceId, u64)>,
}

impl Calls {
    pub fn total(&self) -> usize {
        self.created_decoders.len()
            + self.destroyed_decoders.len()
            + self.created_surfaces.len()
            + self.destroyed_surfaces.len()
            + self.renders.len()
            + self.syncs.len()
            + self.reads.len()
            + self.exports.len()
            + self.imports.len()
    }
}

/// Value of the luma byte at `(x, y)` in surfaces read back from the dummy backend.
pub(crate) fn luma_at(surface: SurfaceId, x: usize, y: usize) -> u8 {
    ((x + 3 * y + surface.0 as usize) % 251) as u8
}

pub(crate) struct DummyBackend {
    kind: Backend,
    next_id: u32,
    decoders: Vec<DecoderId>,
    surfaces: HashMap<SurfaceId, Resolution>,
    calls: Arc<Mutex<Calls>>,
    /// Index of the render call to fail, if any.
    pub fail_render_at: Option<usize>,
    /// Whether surfaces can be exported as DMA-bufs.
    pub exportable: bool,
    /// Whether DMA-bufs can be imported as surfaces.
    pub importable: bool,
    /// Makes surface imports fail with [`BackendError::OutOfResources`].
    pub import_out_of_resources: bool,
}

impl DummyBackend {
    pub(crate) fn new(kind: Backend) -> (Self, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let backend = Self {
            kind,
            next_id: 1,
            decoders: Vec::new(),
            surfaces: HashMap::new(),
            calls: Arc::clone(&calls),
            fail_render_at: None,
            exportable: false,
            importable: false,
            import_out_of_resources: false,
        };

        (backend, calls)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn pitch(extent: Resolution) -> usize {
        align_up(extent.width as usize, 64)
    }
}

impl DecoderBackend for DummyBackend {
    fn kind(&self) -> Backend {
        self.kind
    }

    fn create_decoder(
        &mut self,
        profile: DecoderProfile,
        extent: Resolution,
        max_references: u32,
    ) -> BackendResult<DecoderId> {
        let decoder = DecoderId(self.next_id());
        self.decoders.push(decoder);
        self.calls
            .lock()
            .created_decoders
            .push((profile, extent, max_references));
        Ok(decoder)
    }

    fn destroy_decoder(&mut self, decoder: DecoderId) {
        let index = self.decoders.iter().position(|&d| d == decoder);
        assert!(index.is_some(), "{:?} destroyed twice", decoder);
        self.decoders.retain(|&d| d != decoder);
        self.calls.lock().destroyed_decoders.push(decoder);
    }

    fn create_surface(&mut self, extent: Resolution) -> BackendResult<SurfaceId> {
        let surface = SurfaceId(self.next_id());
        self.surfaces.insert(surface, extent);
        self.calls.lock().created_surfaces.push(surface);
        Ok(surface)
    }

    fn supports_surface_import(&self) -> bool {
        self.importable
    }

    fn import_surface(
        &mut self,
        extent: Resolution,
        dmabuf: DmaBufImport,
    ) -> BackendResult<SurfaceId> {
        if !self.importable {
            return Err(BackendError::Unsupported("surface import"));
        }
        if self.import_out_of_resources {
            return Err(BackendError::OutOfResources);
        }

        let surface = SurfaceId(self.next_id());
        self.surfaces.insert(surface, extent);
        self.calls.lock().imports.push((surface, dmabuf.modifier));
        Ok(surface)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        assert!(
            self.surfaces.remove(&surface).is_some(),
            "{:?} destroyed twice",
            surface
        );
        self.calls.lock().destroyed_surfaces.push(surface);
    }

    fn render(
        &mut self,
        decoder: DecoderId,
        target: SurfaceId,
        picture: &BackendPictureParams,
        slices: &[SliceBuffer],
    ) -> BackendResult<()> {
        let matches_kind = matches!(
            (self.kind, picture),
            (Backend::VaApi, BackendPictureParams::VaApi(_))
                | (Backend::Vdpau, BackendPictureParams::Vdpau(_))
        );
        if !matches_kind {
            return Err(BackendError::Unsupported("picture parameters of another backend"));
        }

        if !self.surfaces.contains_key(&target) {
            return Err(anyhow!("render into unknown {:?}", target).into());
        }

        let mut calls = self.calls.lock();
        let index = calls.renders.len();
        calls.renders.push((decoder, target, slices.len()));

        if self.fail_render_at == Some(index) {
            return Err(anyhow!("render {} failed", index).into());
        }

        Ok(())
    }

    fn sync(&mut self, surface: SurfaceId) -> BackendResult<()> {
        self.calls.lock().syncs.push(surface);
        Ok(())
    }

    fn read_surface(&mut self, surface: SurfaceId, extent: Resolution) -> BackendResult<LinearFrame> {
        if !self.surfaces.contains_key(&surface) {
            return Err(anyhow!("read of unknown {:?}", surface).into());
        }
        self.calls.lock().reads.push(surface);

        let pitch = Self::pitch(extent);
        let height = extent.height as usize;
        let uv_offset = pitch * height;
        let mut data = vec![128u8; uv_offset + pitch * height.div_ceil(2)];

        for y in 0..height {
            for x in 0..extent.width as usize {
                data[y * pitch + x] = luma_at(surface, x, y);
            }
        }

        Ok(LinearFrame {
            data,
            extent,
            planes: [
                PlaneInfo { offset: 0, pitch },
                PlaneInfo {
                    offset: uv_offset,
                    pitch,
                },
            ],
        })
    }

    fn export_dmabuf(&mut self, surface: SurfaceId) -> BackendResult<ExportedSurface> {
        if !self.exportable {
            return Err(BackendError::Unsupported("dma-buf export"));
        }

        let extent = *self
            .surfaces
            .get(&surface)
            .ok_or_else(|| anyhow!("export of unknown {:?}", surface))?;
        self.calls.lock().exports.push(surface);

        // Any fd will do, the dummy device never reads from it.
        let (fd, _) = nix::unistd::pipe().map_err(|e| anyhow!(e))?;
        let pitch = Self::pitch(extent) as u32;

        Ok(ExportedSurface {
            fd,
            width: extent.width,
            height: extent.height,
            fourcc: Fourcc::NV12,
            num_planes: 2,
            pitches: [pitch, pitch, 0],
            offsets: [0, pitch * extent.height, 0],
            modifier: 0,
        })
    }
}
