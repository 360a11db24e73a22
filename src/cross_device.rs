// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Moving decoded pictures from backend surfaces into Vulkan images.
//!
//! The fast path exports the surface as a DMA-buf and lets the device import it and copy it on
//! the GPU. Whenever that is not possible the picture is read back to system memory and written
//! into the image by the CPU, re-tiling it on the way. Failing the fast path is never an error.

use anyhow::anyhow;

use crate::backend::ExportedSurface;
use crate::backend::SurfaceId;
use crate::caps::IMAGE_USAGE_VIDEO_DECODE_DPB;
use crate::caps::IMAGE_USAGE_VIDEO_DECODE_DST;
use crate::device::DmaBufImport;
use crate::device::ImageId;
use crate::device::ImageLayout;
use crate::device::ImportError;
use crate::device::VideoDevice;
use crate::image_processing::fixup_plane_offset;
use crate::image_processing::tiled_plane_size;
use crate::image_processing::transcode_plane;
use crate::image_processing::PlaneLayout;
use crate::image_processing::SwizzleMode;
use crate::image_processing::Y_TILE_HEIGHT;
use crate::session::Session;
use crate::surface_cache::MIN_KEPT_ENTRIES;
use crate::BridgeError;
use crate::BridgeResult;
use crate::Fourcc;
use crate::Resolution;

/// `DRM_FORMAT_MOD_LINEAR`.
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
/// `DRM_FORMAT_MOD_INVALID`, used for imports relying on the legacy implicit tiling.
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;
/// `I915_FORMAT_MOD_Y_TILED`.
pub const I915_FORMAT_MOD_Y_TILED: u64 = 0x0100_0000_0000_0002;

pub const EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD: u32 = 0x0001;
pub const EXTERNAL_MEMORY_HANDLE_TYPE_DMA_BUF: u32 = 0x0200;

pub const EXTERNAL_MEMORY_FEATURE_DEDICATED_ONLY: u32 = 0x1;
pub const EXTERNAL_MEMORY_FEATURE_EXPORTABLE: u32 = 0x2;
pub const EXTERNAL_MEMORY_FEATURE_IMPORTABLE: u32 = 0x4;

/// `VkExternalMemoryProperties`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalMemoryProperties {
    pub features: u32,
    pub export_from_imported_handle_types: u32,
    pub compatible_handle_types: u32,
}

/// Handle types video images can be shared with.
pub fn supported_external_handle_types() -> u32 {
    EXTERNAL_MEMORY_HANDLE_TYPE_DMA_BUF | EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD
}

/// Returns the external memory properties of images with `usage` shared through
/// `handle_type`.
pub fn external_memory_properties(usage: u32, handle_type: u32) -> ExternalMemoryProperties {
    let video_usage = usage & (IMAGE_USAGE_VIDEO_DECODE_DST | IMAGE_USAGE_VIDEO_DECODE_DPB) != 0;
    let shareable = handle_type == EXTERNAL_MEMORY_HANDLE_TYPE_DMA_BUF
        || handle_type == EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD;

    if !video_usage || !shareable {
        return Default::default();
    }

    ExternalMemoryProperties {
        features: EXTERNAL_MEMORY_FEATURE_EXPORTABLE
            | EXTERNAL_MEMORY_FEATURE_IMPORTABLE
            | EXTERNAL_MEMORY_FEATURE_DEDICATED_ONLY,
        export_from_imported_handle_types: supported_external_handle_types(),
        compatible_handle_types: supported_external_handle_types(),
    }
}

/// DRM format modifiers that images of `fourcc` can be exported with.
pub fn format_modifiers(fourcc: Fourcc) -> Vec<u64> {
    if fourcc == Fourcc::NV12 {
        vec![DRM_FORMAT_MOD_LINEAR]
    } else {
        Vec::new()
    }
}

/// Builds the import descriptor of an exported surface, or returns `None` if it cannot be
/// imported as a picture of `extent`.
fn import_descriptor(exported: ExportedSurface, extent: Resolution) -> Option<DmaBufImport> {
    let exported_extent = Resolution::from((exported.width, exported.height));
    if exported_extent != extent || exported.fourcc != Fourcc::NV12 || exported.num_planes != 2 {
        log::warn!(
            "exported surface is {} {} with {} planes, expected {} NV12",
            exported_extent,
            exported.fourcc,
            exported.num_planes,
            extent
        );
        return None;
    }

    let uv_pitch = exported.pitches[1] as usize;
    let uv_height = extent.height.div_ceil(2) as usize;
    let (modifier, uv_size) = match exported.modifier {
        DRM_FORMAT_MOD_LINEAR => (DRM_FORMAT_MOD_LINEAR, uv_pitch * uv_height),
        I915_FORMAT_MOD_Y_TILED => {
            let tile_row_size = uv_pitch * Y_TILE_HEIGHT;
            if tile_row_size != 0 && exported.offsets[1] as usize % tile_row_size != 0 {
                log::warn!(
                    "tiled UV offset {} is not aligned to a row of tiles ({} bytes)",
                    exported.offsets[1],
                    tile_row_size
                );
            }
            (DRM_FORMAT_MOD_INVALID, tiled_plane_size(uv_pitch, uv_height))
        }
        modifier => {
            log::warn!("unknown modifier 0x{:016x}, importing without one", modifier);
            (DRM_FORMAT_MOD_INVALID, uv_pitch * uv_height)
        }
    };

    Some(DmaBufImport {
        fd: exported.fd,
        extent,
        fourcc: exported.fourcc,
        pitches: [exported.pitches[0], exported.pitches[1]],
        offsets: [exported.offsets[0], exported.offsets[1]],
        data_size: u64::from(exported.offsets[1]) + uv_size as u64,
        modifier,
    })
}

/// Tries to share `surface` with `device` through a DMA-buf. Returns whether the picture has
/// been transferred.
fn transfer_dmabuf(
    session: &mut Session,
    device: &mut dyn VideoDevice,
    surface: SurfaceId,
    image: ImageId,
    extent: Resolution,
) -> bool {
    let exported = match session.backend().lock().export_dmabuf(surface) {
        Ok(exported) => exported,
        Err(e) => {
            log::debug!("cannot export {:?}: {}", surface, e);
            return false;
        }
    };

    // The fd is closed here if the import is not even attempted.
    let Some(import) = import_descriptor(exported, extent) else {
        return false;
    };

    match device.import_dmabuf(image, import) {
        Ok(()) => {
            log::debug!("shared {:?} with {:?} through dma-buf", surface, image);
            true
        }
        Err(ImportError::OutOfDeviceMemory) => {
            log::warn!("out of device memory importing {:?}, trimming surface cache", surface);
            session.evict_oldest(MIN_KEPT_ENTRIES);
            false
        }
        Err(e) => {
            log::warn!("dma-buf import of {:?} failed: {}", surface, e);
            false
        }
    }
}

fn copy_plane(
    memory: &mut [u8],
    layout: &ImageLayout,
    index: usize,
    src: &[u8],
    src_layout: PlaneLayout,
    session: &Session,
    swizzle: SwizzleMode,
) -> BridgeResult<()> {
    let plane = &layout.planes[index];
    let width = layout.extent.width as usize;
    let height = match index {
        0 => layout.extent.height as usize,
        _ => layout.extent.height.div_ceil(2) as usize,
    };

    let dst_layout = if session.config().force_linear_copy {
        PlaneLayout::linear(plane.layout.pitch)
    } else {
        plane.layout
    };

    let offset = fixup_plane_offset(plane.offset, plane.alignment);
    let end = offset.saturating_add(plane.size).min(memory.len());
    let dst = memory.get_mut(offset..end).ok_or_else(|| {
        BridgeError::MemoryMapFailed(format!("plane {} at {} is out of the mapping", index, offset))
    })?;

    transcode_plane(dst, dst_layout, src, src_layout, width, height, swizzle)
        .map_err(|e| BridgeError::MemoryMapFailed(format!("plane {}: {}", index, e)))
}

/// Reads `surface` back and writes it into `image` with the CPU.
fn transfer_cpu(
    session: &Session,
    device: &mut dyn VideoDevice,
    surface: SurfaceId,
    image: ImageId,
    extent: Resolution,
) -> BridgeResult<()> {
    let frame = session
        .backend()
        .lock()
        .read_surface(surface, extent)
        .map_err(|e| BridgeError::Unknown(anyhow!("failed to read back {:?}: {}", surface, e)))?;

    let mut layout = device
        .image_layout(image)
        .map_err(|e| BridgeError::MemoryMapFailed(format!("{:#}", e)))?;
    // Only the decoded area is written.
    layout.extent = Resolution::from((
        extent.width.min(layout.extent.width),
        extent.height.min(layout.extent.height),
    ));

    let swizzle = session
        .config()
        .swizzle_override
        .unwrap_or_else(|| device.swizzle_mode());
    let memory = device
        .map_image(image)
        .map_err(|e| BridgeError::MemoryMapFailed(format!("{:#}", e)))?;

    for index in 0..2 {
        let src_layout = PlaneLayout::linear(frame.planes[index].pitch);
        copy_plane(memory, &layout, index, frame.plane(index), src_layout, session, swizzle)?;
    }

    log::debug!("copied {:?} into {:?} ({:?} swizzle)", surface, image, swizzle);

    Ok(())
}

/// Writes the picture decoded in `surface` into `image`.
///
/// Nothing is done for surfaces imported from `image`, which already hold the picture. The
/// DMA-buf path is tried first when enabled and supported by the device. Any failure on that
/// path falls back to a CPU copy.
pub fn transfer_picture(
    session: &mut Session,
    device: &mut dyn VideoDevice,
    surface: SurfaceId,
    image: ImageId,
    extent: Resolution,
) -> BridgeResult<()> {
    if session.is_imported(surface) {
        log::debug!("{:?} was decoded in place into {:?}", image, surface);
        return Ok(());
    }

    if session.config().cross_device
        && device.supports_dmabuf_import()
        && transfer_dmabuf(session, device, surface, image, extent)
    {
        return Ok(());
    }

    transfer_cpu(session, device, surface, image, extent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::luma_at;
    use crate::backend::Backend;
    use crate::config::BridgeConfig;
    use crate::device::tests::FakeDevice;
    use crate::device::tests::ImportBehavior;
    use crate::device::ImageRegistry;
    use crate::image_processing::tiled_copy;
    use crate::image_processing::CopyDirection;
    use crate::session::create_session;
    use crate::session::tests::dummy_context;
    use crate::session::tests::dummy_context_with;
    use crate::session::tests::h264_session_info;

    fn exported(extent: Resolution, modifier: u64, uv_offset: u32) -> ExportedSurface {
        let (fd, _) = nix::unistd::pipe().unwrap();
        ExportedSurface {
            fd,
            width: extent.width,
            height: extent.height,
            fourcc: Fourcc::NV12,
            num_planes: 2,
            pitches: [256, 256, 0],
            offsets: [0, uv_offset, 0],
            modifier,
        }
    }

    #[test]
    fn import_descriptors() {
        let extent = Resolution::from((250, 100));

        let linear = import_descriptor(exported(extent, DRM_FORMAT_MOD_LINEAR, 25600), extent).unwrap();
        assert_eq!(linear.modifier, DRM_FORMAT_MOD_LINEAR);
        assert_eq!(linear.data_size, 25600 + 256 * 50);

        let tiled = import_descriptor(exported(extent, I915_FORMAT_MOD_Y_TILED, 32768), extent).unwrap();
        assert_eq!(tiled.modifier, DRM_FORMAT_MOD_INVALID);
        // 50 rows round up to two rows of tiles, two tiles wide.
        assert_eq!(tiled.data_size, 32768 + 2 * 2 * 4096);

        assert!(import_descriptor(exported(extent, 0, 25600), Resolution::from((256, 100))).is_none());
        let mut three_planes = exported(extent, 0, 25600);
        three_planes.num_planes = 3;
        assert!(import_descriptor(three_planes, extent).is_none());
    }

    #[test]
    fn external_memory_queries() {
        let props = external_memory_properties(
            IMAGE_USAGE_VIDEO_DECODE_DST,
            EXTERNAL_MEMORY_HANDLE_TYPE_DMA_BUF,
        );
        assert_eq!(
            props.features,
            EXTERNAL_MEMORY_FEATURE_EXPORTABLE
                | EXTERNAL_MEMORY_FEATURE_IMPORTABLE
                | EXTERNAL_MEMORY_FEATURE_DEDICATED_ONLY
        );
        assert_eq!(props.compatible_handle_types, supported_external_handle_types());

        assert_eq!(
            external_memory_properties(0x4, EXTERNAL_MEMORY_HANDLE_TYPE_DMA_BUF),
            Default::default()
        );
        assert_eq!(
            external_memory_properties(IMAGE_USAGE_VIDEO_DECODE_DPB, 0x8),
            Default::default()
        );

        assert_eq!(format_modifiers(Fourcc::NV12), vec![DRM_FORMAT_MOD_LINEAR]);
        assert!(format_modifiers(Fourcc::from_bytes(b"YUYV")).is_empty());
    }

    /// Reads the luma plane of a tiled image of the fake device back to linear.
    fn read_luma(device: &FakeDevice, image: ImageId, swizzle: SwizzleMode) -> (Vec<u8>, usize) {
        let (layout, memory) = &device.images[&image];
        let plane = layout.planes[0];
        let width = layout.extent.width as usize;
        let height = layout.extent.height as usize;
        let mut linear = vec![0u8; width * height];
        tiled_copy(
            &mut linear,
            &memory[plane.offset..plane.offset + plane.size],
            width,
            height,
            width,
            plane.layout.pitch,
            CopyDirection::TiledToLinear,
            swizzle,
        )
        .unwrap();

        (linear, width)
    }

    #[test]
    fn cpu_copy_retiles() {
        let _ = env_logger::try_init();

        let (ctx, calls) = dummy_context(
            Backend::Vdpau,
            BridgeConfig::default().swizzle_override(SwizzleMode::Bit9),
        );
        let mut session = create_session(&ctx, &h264_session_info(4)).unwrap();
        let image = ImageRegistry::new().register();
        let extent = Resolution::from((200, 40));
        let mut device = FakeDevice::new();
        device.add_tiled_image(image, extent);

        session.ensure_decoder(extent).unwrap();
        let surface = session.surface_for(image, extent, &device).unwrap();
        transfer_picture(&mut session, &mut device, surface, image, extent).unwrap();

        let (luma, width) = read_luma(&device, image, SwizzleMode::Bit9);
        for (y, row) in luma.chunks(width).enumerate() {
            for (x, &value) in row.iter().enumerate() {
                assert_eq!(value, luma_at(surface, x, y), "at ({}, {})", x, y);
            }
        }
        assert_eq!(calls.lock().reads, vec![surface]);
        assert!(calls.lock().exports.is_empty());
    }

    #[test]
    fn import_out_of_memory_falls_back_and_trims_cache() {
        let _ = env_logger::try_init();

        let (ctx, calls) = dummy_context_with(Backend::Vdpau, BridgeConfig::default(), |backend| {
            backend.exportable = true
        });
        let mut session = create_session(&ctx, &h264_session_info(8)).unwrap();

        let mut registry = ImageRegistry::new();
        let extent = Resolution::from((128, 32));
        let images: Vec<_> = (0..6).map(|_| registry.register()).collect();
        let mut device = FakeDevice::new();
        device.import = ImportBehavior::OutOfDeviceMemory;

        session.ensure_decoder(extent).unwrap();
        let surfaces: Vec<_> = images
            .iter()
            .map(|&image| {
                device.add_tiled_image(image, extent);
                session.surface_for(image, extent, &device).unwrap()
            })
            .collect();

        // The surface being transferred belongs to a pending decode.
        let target = images[5];
        let _pin = session.pin(target).unwrap();

        transfer_picture(&mut session, &mut device, surfaces[5], target, extent).unwrap();

        assert_eq!(session.cache().len(), MIN_KEPT_ENTRIES);
        assert_eq!(session.lookup_surface(target), Some(surfaces[5]));
        let calls = calls.lock();
        assert_eq!(calls.exports, vec![surfaces[5]]);
        assert_eq!(calls.destroyed_surfaces, surfaces[..3].to_vec());
        assert_eq!(calls.reads, vec![surfaces[5]]);
    }

    #[test]
    fn import_success_skips_cpu_copy() {
        let (ctx, calls) = dummy_context_with(Backend::Vdpau, BridgeConfig::default(), |backend| {
            backend.exportable = true
        });
        let mut session = create_session(&ctx, &h264_session_info(4)).unwrap();
        let image = ImageRegistry::new().register();
        let extent = Resolution::from((128, 32));
        let mut device = FakeDevice::new();
        device.add_tiled_image(image, extent);
        device.import = ImportBehavior::Succeed;

        session.ensure_decoder(extent).unwrap();
        let surface = session.surface_for(image, extent, &device).unwrap();
        transfer_picture(&mut session, &mut device, surface, image, extent).unwrap();

        assert_eq!(device.imports, vec![(image, extent, DRM_FORMAT_MOD_LINEAR)]);
        assert!(calls.lock().reads.is_empty());
    }

    #[test]
    fn disabled_cross_device_uses_cpu() {
        let (ctx, calls) = dummy_context_with(
            Backend::Vdpau,
            BridgeConfig::default().cross_device(false),
            |backend| backend.exportable = true,
        );
        let mut session = create_session(&ctx, &h264_session_info(4)).unwrap();
        let image = ImageRegistry::new().register();
        let extent = Resolution::from((128, 32));
        let mut device = FakeDevice::new();
        device.add_tiled_image(image, extent);
        device.import = ImportBehavior::Succeed;

        session.ensure_decoder(extent).unwrap();
        let surface = session.surface_for(image, extent, &device).unwrap();
        transfer_picture(&mut session, &mut device, surface, image, extent).unwrap();

        assert!(device.imports.is_empty());
        assert!(calls.lock().exports.is_empty());
        assert_eq!(calls.lock().reads, vec![surface]);
    }

    #[test]
    fn imported_surfaces_need_no_transfer() {
        let (ctx, calls) = dummy_context_with(Backend::VaApi, BridgeConfig::default(), |backend| {
            backend.importable = true;
            backend.exportable = true;
        });
        let mut session = create_session(&ctx, &h264_session_info(4)).unwrap();
        let image = ImageRegistry::new().register();
        let extent = Resolution::from((128, 32));
        let mut device = FakeDevice::new();
        device.add_tiled_image(image, extent);
        device.exportable = true;
        device.import = ImportBehavior::Succeed;

        let surface = session.surface_for(image, extent, &device).unwrap();
        transfer_picture(&mut session, &mut device, surface, image, extent).unwrap();

        assert!(device.imports.is_empty());
        let calls = calls.lock();
        assert_eq!(calls.imports.len(), 1);
        assert!(calls.exports.is_empty());
        assert!(calls.reads.is_empty());
    }
}
