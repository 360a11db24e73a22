// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Vulkan side of the bridge.
//!
//! The bridge does not own Vulkan images. It refers to them through generation-checked
//! [`ImageId`]s and reaches their memory through the [`VideoDevice`] trait, which the Vulkan
//! driver implements.

use std::os::fd::OwnedFd;

use thiserror::Error;

use crate::image_processing::PlaneLayout;
use crate::image_processing::SwizzleMode;
use crate::Fourcc;
use crate::Resolution;

/// Stable identity of a Vulkan image.
///
/// Once the image is destroyed its slot is reused with a new generation, so a stale id never
/// compares equal to the id of the image that replaced it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId {
    index: u32,
    generation: u32,
}

impl ImageId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Issues [`ImageId`]s and tracks which ones are still alive.
#[derive(Debug, Default)]
pub struct ImageRegistry {
    /// Current generation and liveness of each slot.
    slots: Vec<(u32, bool)>,
    free: Vec<u32>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a newly created image.
    pub fn register(&mut self) -> ImageId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.1 = true;
                ImageId {
                    index,
                    generation: slot.0,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push((0, true));
                ImageId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Marks `image` as destroyed. Returns `false` if it was already stale.
    pub fn unregister(&mut self, image: ImageId) -> bool {
        if !self.is_live(image) {
            return false;
        }

        let slot = &mut self.slots[image.index as usize];
        slot.0 = slot.0.wrapping_add(1);
        slot.1 = false;
        self.free.push(image.index);

        true
    }

    pub fn is_live(&self, image: ImageId) -> bool {
        matches!(
            self.slots.get(image.index as usize),
            Some(&(generation, true)) if generation == image.generation
        )
    }
}

/// One plane of an image as bound in device memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImagePlane {
    /// Offset of the plane from the start of the image memory.
    pub offset: usize,
    /// Size in bytes of the plane, including tile padding.
    pub size: usize,
    /// Alignment the plane offset is supposed to have.
    pub alignment: usize,
    pub layout: PlaneLayout,
}

/// Memory layout of a two-plane NV12 image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageLayout {
    pub extent: Resolution,
    /// Y then UV.
    pub planes: [ImagePlane; 2],
}

/// A NV12 DMA-buf crossing between the device and a backend, either exported by a backend for
/// import into an image, or exported from an image for import into a backend.
#[derive(Debug)]
pub struct DmaBufImport {
    /// Closed by the importer once the kernel has taken its own reference.
    pub fd: OwnedFd,
    pub extent: Resolution,
    pub fourcc: Fourcc,
    pub pitches: [u32; 2],
    pub offsets: [u32; 2],
    pub data_size: u64,
    pub modifier: u64,
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("dma-buf import not supported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Services the bridge needs from the Vulkan device owning the destination images.
pub trait VideoDevice {
    /// Returns the layout of `image`.
    fn image_layout(&self, image: ImageId) -> anyhow::Result<ImageLayout>;

    /// Bit-6 swizzling configured by the memory controller of this device.
    fn swizzle_mode(&self) -> SwizzleMode;

    /// Maps the memory bound to `image` for CPU access. The slice starts at the image's
    /// memory offset and covers all of its planes.
    fn map_image(&mut self, image: ImageId) -> anyhow::Result<&mut [u8]>;

    /// Whether this device can import DMA-bufs at all.
    fn supports_dmabuf_import(&self) -> bool {
        false
    }

    /// Imports `dmabuf` and copies its content into `image` on the GPU, waiting for the copy to
    /// complete.
    fn import_dmabuf(&mut self, image: ImageId, dmabuf: DmaBufImport) -> Result<(), ImportError> {
        let _ = (image, dmabuf);
        Err(ImportError::Unsupported("device has no dma-buf import".into()))
    }

    /// Exports the memory bound to `image` as a DMA-buf. The Y plane must start at offset 0 of
    /// the buffer.
    fn export_image(&self, image: ImageId) -> Result<DmaBufImport, ImportError> {
        let _ = image;
        Err(ImportError::Unsupported("device has no dma-buf export".into()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::cross_device::I915_FORMAT_MOD_Y_TILED;
    use crate::image_processing::tiled_plane_size;

    /// Behavior of [`FakeDevice::import_dmabuf`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) enum ImportBehavior {
        Unsupported,
        Succeed,
        OutOfDeviceMemory,
    }

    /// In-memory device used by the tests of this crate.
    pub(crate) struct FakeDevice {
        pub images: HashMap<ImageId, (ImageLayout, Vec<u8>)>,
        pub swizzle: SwizzleMode,
        pub import: ImportBehavior,
        pub imports: Vec<(ImageId, Resolution, u64)>,
        /// Whether [`VideoDevice::export_image`] succeeds.
        pub exportable: bool,
    }

    impl FakeDevice {
        pub(crate) fn new() -> Self {
            Self {
                images: HashMap::new(),
                swizzle: SwizzleMode::None,
                import: ImportBehavior::Unsupported,
                imports: Vec::new(),
                exportable: false,
            }
        }

        /// Adds a Y-tiled NV12 image of `extent`.
        pub(crate) fn add_tiled_image(&mut self, image: ImageId, extent: Resolution) {
            let pitch = crate::utils::align_up(extent.width as usize, 128);
            let y_size = tiled_plane_size(pitch, extent.height as usize);
            let uv_size = tiled_plane_size(pitch, extent.height.div_ceil(2) as usize);
            let layout = ImageLayout {
                extent,
                planes: [
                    ImagePlane {
                        offset: 0,
                        size: y_size,
                        alignment: 4096,
                        layout: PlaneLayout::y_tiled(pitch),
                    },
                    ImagePlane {
                        offset: y_size,
                        size: uv_size,
                        alignment: 4096,
                        layout: PlaneLayout::y_tiled(pitch),
                    },
                ],
            };
            self.images.insert(image, (layout, vec![0; y_size + uv_size]));
        }
    }

    impl VideoDevice for FakeDevice {
        fn image_layout(&self, image: ImageId) -> anyhow::Result<ImageLayout> {
            self.images
                .get(&image)
                .map(|(layout, _)| *layout)
                .ok_or_else(|| anyhow::anyhow!("unknown image {:?}", image))
        }

        fn swizzle_mode(&self) -> SwizzleMode {
            self.swizzle
        }

        fn map_image(&mut self, image: ImageId) -> anyhow::Result<&mut [u8]> {
            self.images
                .get_mut(&image)
                .map(|(_, memory)| memory.as_mut_slice())
                .ok_or_else(|| anyhow::anyhow!("unknown image {:?}", image))
        }

        fn supports_dmabuf_import(&self) -> bool {
            self.import != ImportBehavior::Unsupported
        }

        fn import_dmabuf(
            &mut self,
            image: ImageId,
            dmabuf: DmaBufImport,
        ) -> Result<(), ImportError> {
            match self.import {
                ImportBehavior::Unsupported => Err(ImportError::Unsupported("fake".into())),
                ImportBehavior::OutOfDeviceMemory => Err(ImportError::OutOfDeviceMemory),
                ImportBehavior::Succeed => {
                    self.imports.push((image, dmabuf.extent, dmabuf.modifier));
                    Ok(())
                }
            }
        }

        fn export_image(&self, image: ImageId) -> Result<DmaBufImport, ImportError> {
            if !self.exportable {
                return Err(ImportError::Unsupported("fake".into()));
            }

            let (layout, memory) = self
                .images
                .get(&image)
                .ok_or_else(|| anyhow::anyhow!("unknown image {:?}", image))?;
            let (fd, _) = nix::unistd::pipe().map_err(anyhow::Error::from)?;
            let [y, uv] = layout.planes;

            Ok(DmaBufImport {
                fd,
                extent: layout.extent,
                fourcc: Fourcc::NV12,
                pitches: [y.layout.pitch as u32, uv.layout.pitch as u32],
                offsets: [y.offset as u32, uv.offset as u32],
                data_size: memory.len() as u64,
                modifier: I915_FORMAT_MOD_Y_TILED,
            })
        }
    }

    #[test]
    fn registry_detects_stale_ids() {
        let mut registry = ImageRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert!(registry.is_live(a));
        assert!(registry.is_live(b));

        assert!(registry.unregister(a));
        assert!(!registry.is_live(a));
        assert!(!registry.unregister(a));

        // The slot is reused with a new generation.
        let c = registry.register();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert!(registry.is_live(c));
        assert!(!registry.is_live(a));
    }
}
