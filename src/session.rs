// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video sessions and the backend they share.
//!
//! A [`BridgeContext`] exists once per Vulkan device. It opens the backend the first time a
//! session needs it and hands the same handle to every session afterwards. Each [`Session`]
//! owns a backend decoder and the [`SurfaceCache`] mapping its images to backend surfaces.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::backend::DecoderBackend;
use crate::backend::DecoderId;
use crate::backend::DecoderProfile;
use crate::backend::SharedBackend;
use crate::backend::SurfaceId;
use crate::caps;
use crate::codec::CodecOperation;
use crate::codec::VideoProfile;
use crate::config::BridgeConfig;
use crate::device::ImageId;
use crate::device::VideoDevice;
use crate::surface_cache::CacheError;
use crate::surface_cache::SurfaceCache;
use crate::surface_cache::SurfacePin;
use crate::surface_cache::MIN_KEPT_ENTRIES;
use crate::translate::decoder_profile;
use crate::BridgeError;
use crate::BridgeResult;
use crate::Resolution;

/// Opens the backend of a context.
pub type BackendOpener =
    Box<dyn Fn(&BridgeConfig) -> anyhow::Result<Box<dyn DecoderBackend + Send>> + Send + Sync>;

/// Opens the backend selected by `config`.
pub fn open_backend(config: &BridgeConfig) -> anyhow::Result<Box<dyn DecoderBackend + Send>> {
    match config.backend {
        #[cfg(feature = "vaapi")]
        Backend::VaApi => Ok(Box::new(crate::backend::vaapi::VaapiBackend::open(
            config.drm_device.as_deref(),
        )?)),
        #[cfg(feature = "vdpau")]
        Backend::Vdpau => Ok(Box::new(crate::backend::vdpau::VdpauBackend::open(
            config.readback_pitch,
        )?)),
        #[allow(unreachable_patterns)]
        backend => Err(anyhow!("{} support is not built in", backend)),
    }
}

/// Per-device state of the bridge.
pub struct BridgeContext {
    config: BridgeConfig,
    opener: BackendOpener,
    backend: OnceCell<SharedBackend>,
    next_session_id: AtomicU64,
}

impl BridgeContext {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_opener(config, Box::new(open_backend))
    }

    /// Creates a context opening its backend with `opener` instead of [`open_backend`].
    pub fn with_opener(config: BridgeConfig, opener: BackendOpener) -> Self {
        Self {
            config,
            opener,
            backend: OnceCell::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Returns the backend of the device, opening it on first use.
    ///
    /// Concurrent first callers block until the one opening the backend is done, then all get
    /// the same handle. If opening fails the next call tries again.
    pub fn backend(&self) -> BridgeResult<SharedBackend> {
        self.backend
            .get_or_try_init(|| -> anyhow::Result<SharedBackend> {
                log::debug!("opening {} backend", self.config.backend);
                let backend = (self.opener)(&self.config)?;
                Ok(Arc::new(Mutex::new(backend)))
            })
            .cloned()
            .map_err(|e| {
                log::error!("failed to open {} backend: {:#}", self.config.backend, e);
                BridgeError::InitializationFailed(format!("{:#}", e))
            })
    }
}

/// Parameters of [`create_session`], from `VkVideoSessionCreateInfoKHR`.
#[derive(Copy, Clone, Debug)]
pub struct SessionCreateInfo {
    pub profile: VideoProfile,
    pub max_coded_extent: Resolution,
    pub max_dpb_slots: u32,
    pub max_active_reference_pictures: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct DecoderState {
    id: DecoderId,
    extent: Resolution,
}

/// A video decode session.
pub struct Session {
    id: u64,
    config: BridgeConfig,
    backend: SharedBackend,
    kind: Backend,
    profile: DecoderProfile,
    max_coded_extent: Resolution,
    max_dpb_slots: u32,
    decoder: Option<DecoderState>,
    cache: SurfaceCache,
    /// Surfaces wrapping the memory of their image.
    imported: HashSet<SurfaceId>,
}

/// Creates a decode session on the backend of `ctx`.
pub fn create_session(ctx: &BridgeContext, info: &SessionCreateInfo) -> BridgeResult<Session> {
    if info.profile.operation != CodecOperation::DecodeH264 {
        return Err(BridgeError::VideoProfileOperationNotSupported);
    }

    let caps = caps::video_capabilities(info.profile.operation)
        .ok_or(BridgeError::VideoProfileOperationNotSupported)?;
    if !caps.max_coded_extent.can_contain(info.max_coded_extent)
        || !info.max_coded_extent.can_contain(caps.min_coded_extent)
    {
        return Err(BridgeError::FormatNotSupported(format!(
            "coded extent {} out of range",
            info.max_coded_extent
        )));
    }
    if info.max_dpb_slots > caps.max_dpb_slots
        || info.max_active_reference_pictures > caps.max_active_reference_pictures
    {
        return Err(BridgeError::TooManyObjects(format!(
            "{} DPB slots and {} active references requested",
            info.max_dpb_slots, info.max_active_reference_pictures
        )));
    }

    let backend = ctx.backend()?;
    let kind = backend.lock().kind();
    let profile = decoder_profile(kind, info.profile.h264_profile_idc);
    let capacity = ctx
        .config()
        .cache_capacity
        .unwrap_or(info.max_dpb_slots as usize + 1);

    let mut session = Session {
        id: ctx.next_session_id.fetch_add(1, Ordering::Relaxed),
        config: ctx.config().clone(),
        backend,
        kind,
        profile,
        max_coded_extent: info.max_coded_extent,
        max_dpb_slots: info.max_dpb_slots,
        decoder: None,
        cache: SurfaceCache::new(capacity),
        imported: HashSet::new(),
    };

    // VA-API contexts cover every picture up to the maximum extent, so they can be created
    // right away. VDPAU decoders are sized after the first picture.
    if kind == Backend::VaApi {
        session.ensure_decoder(info.max_coded_extent)?;
    }

    log::debug!(
        "created {} session {} ({:?}, {}, cache of {})",
        kind,
        session.id,
        profile,
        info.max_coded_extent,
        capacity
    );

    Ok(session)
}

/// Destroys `session` along with its surfaces and decoder.
pub fn destroy_session(session: Session) {
    drop(session)
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> Backend {
        self.kind
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn profile(&self) -> DecoderProfile {
        self.profile
    }

    pub fn cache(&self) -> &SurfaceCache {
        &self.cache
    }

    /// The current decoder and the extent it was created for.
    pub fn decoder(&self) -> Option<(DecoderId, Resolution)> {
        self.decoder.map(|d| (d.id, d.extent))
    }

    fn destroy_surfaces(&mut self, surfaces: Vec<SurfaceId>) {
        if surfaces.is_empty() {
            return;
        }

        let mut backend = self.backend.lock();
        for surface in surfaces {
            self.imported.remove(&surface);
            backend.destroy_surface(surface);
        }
    }

    fn destroy_decoder(&mut self) {
        let surfaces = self.cache.drain();
        self.destroy_surfaces(surfaces);

        if let Some(decoder) = self.decoder.take() {
            self.backend.lock().destroy_decoder(decoder.id);
        }
    }

    /// Returns a decoder able to decode pictures of `extent`, creating it if needed.
    ///
    /// A decoder created for another geometry is replaced, which also destroys every cached
    /// surface since surfaces belong to the decoder they were created with.
    pub fn ensure_decoder(&mut self, extent: Resolution) -> BridgeResult<DecoderId> {
        if !self.max_coded_extent.can_contain(extent) {
            return Err(BridgeError::FormatNotSupported(format!(
                "picture of {} larger than the session maximum of {}",
                extent, self.max_coded_extent
            )));
        }

        let extent = match self.kind {
            Backend::VaApi => self.max_coded_extent,
            Backend::Vdpau => extent,
        };

        if let Some(decoder) = self.decoder {
            if decoder.extent == extent {
                return Ok(decoder.id);
            }

            if self.cache.has_pinned_entries() {
                return Err(BridgeError::InitializationFailed(format!(
                    "cannot resize decoder from {} to {} with decodes pending",
                    decoder.extent, extent
                )));
            }

            log::debug!(
                "session {}: rebuilding decoder for {} (was {})",
                self.id,
                extent,
                decoder.extent
            );
            self.destroy_decoder();
        }

        let id = self
            .backend
            .lock()
            .create_decoder(self.profile, extent, self.max_dpb_slots)
            .map_err(|e| BridgeError::InitializationFailed(format!("failed to create decoder: {}", e)))?;
        self.decoder = Some(DecoderState { id, extent });

        Ok(id)
    }

    /// Returns the surface of `image`, creating one of `extent` if it does not have one yet.
    ///
    /// With cross-device sharing enabled, the memory of `image` is first offered to the
    /// backend so pictures land in it directly. Any failure to do so falls back to a surface
    /// owned by the backend.
    pub fn surface_for(
        &mut self,
        image: ImageId,
        extent: Resolution,
        device: &dyn VideoDevice,
    ) -> BridgeResult<SurfaceId> {
        if let Some(surface) = self.cache.lookup(image) {
            return Ok(surface);
        }

        let (surface, imported) = match self.import_image(image, extent, device) {
            Some(surface) => (surface, true),
            None => (self.backend.lock().create_surface(extent)?, false),
        };

        match self.cache.insert_or_update(image, surface) {
            Ok(evicted) => {
                log::debug!("session {}: new {:?} for {:?}", self.id, surface, image);
                if imported {
                    self.imported.insert(surface);
                }
                self.destroy_surfaces(evicted.into_iter().collect());
                Ok(surface)
            }
            Err(e) => {
                self.destroy_surfaces(vec![surface]);
                Err(BridgeError::TooManyObjects(e.to_string()))
            }
        }
    }

    /// Wraps the memory of `image` in a backend surface. Returns `None` if that is not possible.
    fn import_image(
        &mut self,
        image: ImageId,
        extent: Resolution,
        device: &dyn VideoDevice,
    ) -> Option<SurfaceId> {
        if !self.config.cross_device || !self.backend.lock().supports_surface_import() {
            return None;
        }

        let dmabuf = match device.export_image(image) {
            Ok(dmabuf) => dmabuf,
            Err(e) => {
                log::debug!("session {}: {:?} cannot be exported: {}", self.id, image, e);
                return None;
            }
        };

        if dmabuf.extent != extent {
            log::debug!(
                "session {}: {:?} is {}, decoding at {}, not importing it",
                self.id,
                image,
                dmabuf.extent,
                extent
            );
            return None;
        }

        let result = self.backend.lock().import_surface(extent, dmabuf);
        match result {
            Ok(surface) => {
                log::debug!("session {}: imported {:?} as {:?}", self.id, image, surface);
                Some(surface)
            }
            Err(BackendError::OutOfResources) => {
                log::warn!(
                    "session {}: out of memory importing {:?}, evicting old surfaces",
                    self.id,
                    image
                );
                self.evict_oldest(MIN_KEPT_ENTRIES);
                None
            }
            Err(e) => {
                log::warn!("session {}: failed to import {:?}: {}", self.id, image, e);
                None
            }
        }
    }

    /// Whether `surface` wraps the memory of its image, so decoded pictures need no transfer.
    pub fn is_imported(&self, surface: SurfaceId) -> bool {
        self.imported.contains(&surface)
    }

    /// Returns the surface cached for `image`, if any.
    pub fn lookup_surface(&mut self, image: ImageId) -> Option<SurfaceId> {
        self.cache.lookup(image)
    }

    pub(crate) fn pin(&self, image: ImageId) -> Option<SurfacePin> {
        self.cache.pin(image)
    }

    /// Evicts old surfaces after the device ran out of memory, keeping at least `keep_count`.
    pub fn evict_oldest(&mut self, keep_count: usize) {
        let evicted = self.cache.evict_oldest(keep_count);
        self.destroy_surfaces(evicted);
    }

    /// Drops the surface of an image that is being destroyed.
    pub fn forget_image(&mut self, image: ImageId) -> BridgeResult<()> {
        match self.cache.remove(image) {
            Ok(surface) => {
                self.destroy_surfaces(surface.into_iter().collect());
                Ok(())
            }
            Err(CacheError::Pinned(_)) => {
                Err(BridgeError::InvalidState("image destroyed while decodes are pending"))
            }
            Err(e) => Err(BridgeError::Unknown(e.into())),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.cache.has_pinned_entries() {
            log::warn!("session {} destroyed with decodes pending", self.id);
        }

        self.destroy_decoder();
        log::debug!("destroyed session {}", self.id);
    }
}
