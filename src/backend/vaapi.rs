// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VA-API backend.
//!
//! Each decoder owns a VA config and context sized for the largest picture of its session.
//! Surfaces are either NV12 surfaces allocated by the driver, or DRM PRIME imports of the
//! memory of a Vulkan image. They are rendered through `vaBeginPicture`/`vaRenderPicture`/
//! `vaEndPicture`, then exported as DMA-bufs or mapped back through a `VAImage`.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context as AnyhowContext;
use libva::BufferType;
use libva::Config;
use libva::Context;
use libva::Display;
use libva::IQMatrix;
use libva::IQMatrixBufferH264;
use libva::Picture as VaPicture;
use libva::PictureParameter;
use libva::PictureParameterBufferH264;
use libva::SliceParameter;
use libva::Surface;
use libva::SurfaceMemoryDescriptor;

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
use crate::image_processing::nv12_copy;
use crate::translate::vaapi::PictureH264;
use crate::translate::vaapi::PictureParams;
use crate::translate::vaapi::SliceParams as VaSliceParams;
use crate::translate::BackendPictureParams;
use crate::translate::SliceBuffer;
use crate::translate::SliceParams;
use crate::translate::MAX_FLAT_LIST_ENTRIES;
use crate::Fourcc;
use crate::Resolution;

fn va_profile(profile: DecoderProfile) -> i32 {
    match profile {
        // VA-API has no proper baseline profile, drivers decode it as constrained baseline.
        DecoderProfile::H264ConstrainedBaseline | DecoderProfile::H264Baseline => {
            libva::VAProfile::VAProfileH264ConstrainedBaseline
        }
        DecoderProfile::H264Main => libva::VAProfile::VAProfileH264Main,
        DecoderProfile::H264High => libva::VAProfile::VAProfileH264High,
    }
}

fn va_picture(pic: &PictureH264) -> libva::PictureH264 {
    libva::PictureH264::new(
        pic.picture_id,
        pic.frame_idx,
        pic.flags,
        pic.top_field_order_cnt,
        pic.bottom_field_order_cnt,
    )
}

fn va_picture_list<const N: usize>(list: &[PictureH264]) -> [libva::PictureH264; N] {
    std::array::from_fn(|i| va_picture(list.get(i).unwrap_or(&PictureH264::INVALID)))
}

fn build_pic_param(params: &PictureParams) -> BufferType {
    let seq = &params.seq_fields;
    let seq_fields = libva::H264SeqFields::new(
        seq.chroma_format_idc,
        seq.residual_colour_transform_flag,
        seq.gaps_in_frame_num_value_allowed_flag,
        seq.frame_mbs_only_flag,
        seq.mb_adaptive_frame_field_flag,
        seq.direct_8x8_inference_flag,
        seq.min_luma_bi_pred_size8x8,
        seq.log2_max_frame_num_minus4,
        seq.pic_order_cnt_type,
        seq.log2_max_pic_order_cnt_lsb_minus4,
        seq.delta_pic_order_always_zero_flag,
    );

    let pic = &params.pic_fields;
    let pic_fields = libva::H264PicFields::new(
        pic.entropy_coding_mode_flag,
        pic.weighted_pred_flag,
        pic.weighted_bipred_idc,
        pic.transform_8x8_mode_flag,
        pic.field_pic_flag,
        pic.constrained_intra_pred_flag,
        pic.pic_order_present_flag,
        pic.deblocking_filter_control_present_flag,
        pic.redundant_pic_cnt_present_flag,
        pic.reference_pic_flag,
    );

    BufferType::PictureParameter(PictureParameter::H264(PictureParameterBufferH264::new(
        va_picture(&params.curr_pic),
        va_picture_list(&params.reference_frames),
        params.picture_width_in_mbs_minus1,
        params.picture_height_in_mbs_minus1,
        params.bit_depth_luma_minus8,
        params.bit_depth_chroma_minus8,
        params.num_ref_frames,
        &seq_fields,
        0, /* FMO not supported by VA */
        0, /* FMO not supported by VA */
        0, /* FMO not supported by VA */
        params.pic_init_qp_minus26,
        params.pic_init_qs_minus26,
        params.chroma_qp_index_offset,
        params.second_chroma_qp_index_offset,
        &pic_fields,
        params.frame_num,
    )))
}

fn build_iq_matrix(params: &PictureParams) -> BufferType {
    BufferType::IQMatrix(IQMatrix::H264(IQMatrixBufferH264::new(
        params.iq_matrix.scaling_list_4x4,
        params.iq_matrix.scaling_list_8x8,
    )))
}

/// Builds the slice parameters for a slice submitted in its own data buffer.
///
/// The slice header fields are left to the driver, which parses them from the slice data.
fn build_slice_param(slice: &VaSliceParams) -> BufferType {
    let ref_list_0: [libva::PictureH264; MAX_FLAT_LIST_ENTRIES] =
        va_picture_list(&slice.ref_pic_list_0);
    let ref_list_1: [libva::PictureH264; MAX_FLAT_LIST_ENTRIES] =
        va_picture_list(&slice.ref_pic_list_1);

    BufferType::SliceParameter(SliceParameter::H264(libva::SliceParameterBufferH264::new(
        slice.slice_data_size,
        0,
        slice.slice_data_flag,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        ref_list_0,
        ref_list_1,
        0,
        0,
        0,
        [0; 32],
        [0; 32],
        0,
        [[0; 2]; 32],
        [[0; 2]; 32],
        0,
        [0; 32],
        [0; 32],
        0,
        [[0; 2]; 32],
        [[0; 2]; 32],
    )))
}

/// Checks that an exported descriptor describes both NV12 planes in a single object, which is
/// the only layout the bridge can import.
fn single_object_planes(
    num_objects: usize,
    num_layers: usize,
    num_planes: u32,
    object_index: &[u32],
) -> bool {
    num_objects == 1
        && num_layers == 1
        && num_planes == 2
        && object_index.iter().take(2).all(|&index| index == 0)
}

/// Builds the DRM PRIME descriptor of a single-object NV12 buffer.
fn prime_descriptor(dmabuf: &DmaBufImport) -> libva::VADRMPRIMESurfaceDescriptor {
    let mut objects: [libva::VADRMPRIMESurfaceDescriptorObject; 4] = Default::default();
    objects[0] = libva::VADRMPRIMESurfaceDescriptorObject {
        fd: dmabuf.fd.as_raw_fd(),
        // Zero lets the driver take the size of the buffer.
        size: u32::try_from(dmabuf.data_size).unwrap_or(0),
        drm_format_modifier: dmabuf.modifier,
    };

    let [y_pitch, uv_pitch] = dmabuf.pitches;
    let [y_offset, uv_offset] = dmabuf.offsets;
    let layers = [
        libva::VADRMPRIMESurfaceDescriptorLayer {
            drm_format: u32::from(dmabuf.fourcc),
            num_planes: 2,
            object_index: [0, 0, 0, 0],
            offset: [y_offset, uv_offset, 0, 0],
            pitch: [y_pitch, uv_pitch, 0, 0],
        },
        Default::default(),
        Default::default(),
        Default::default(),
    ];

    libva::VADRMPRIMESurfaceDescriptor {
        fourcc: u32::from(dmabuf.fourcc),
        width: dmabuf.extent.width,
        height: dmabuf.extent.height,
        num_objects: 1,
        objects,
        num_layers: 1,
        layers,
    }
}

/// Memory of a Vulkan image lent to the driver as the backing of a surface.
struct ImportedImage(DmaBufImport);

impl libva::ExternalBufferDescriptor for ImportedImage {
    const MEMORY_TYPE: libva::MemoryType = libva::MemoryType::DrmPrime2;
    type DescriptorAttribute = libva::VADRMPRIMESurfaceDescriptor;

    fn va_surface_attribute(&mut self) -> Self::DescriptorAttribute {
        prime_descriptor(&self.0)
    }
}

/// Submits the decode of one picture into `surface`.
fn submit_picture<M: SurfaceMemoryDescriptor>(
    context: &Rc<Context>,
    surface: Rc<Surface<M>>,
    params: &PictureParams,
    slices: &[SliceBuffer],
) -> BackendResult<()> {
    let mut va_picture = VaPicture::new(0, Rc::clone(context), surface);

    let pic_param = context
        .create_buffer(build_pic_param(params))
        .context("while creating picture parameter buffer")?;
    let iq_matrix = context
        .create_buffer(build_iq_matrix(params))
        .context("while creating IQ matrix buffer")?;
    va_picture.add_buffer(pic_param);
    va_picture.add_buffer(iq_matrix);

    for (index, slice) in slices.iter().enumerate() {
        let SliceParams::VaApi(slice_params) = &slice.params else {
            return Err(anyhow!("slice {} has no VA-API parameters", index).into());
        };

        let slice_param = context
            .create_buffer(build_slice_param(slice_params))
            .with_context(|| format!("while creating slice {} params buffer", index))?;
        va_picture.add_buffer(slice_param);

        let slice_data = context
            .create_buffer(BufferType::SliceData(Vec::from(slice.data.as_ref())))
            .with_context(|| format!("while creating slice {} data buffer", index))?;
        va_picture.add_buffer(slice_data);
    }

    // The submitted buffers are released with the picture once the driver consumed them.
    va_picture
        .begin()
        .context("vaBeginPicture failed")?
        .render()
        .context("vaRenderPicture failed")?
        .end()
        .context("vaEndPicture failed")?;

    Ok(())
}

/// Maps `surface` through a `VAImage` of `format` and copies its visible part out as NV12.
fn map_nv12<M: SurfaceMemoryDescriptor>(
    surface: &Surface<M>,
    format: libva::VAImageFormat,
    extent: Resolution,
) -> anyhow::Result<LinearFrame> {
    let size = surface.size();
    let image = libva::Image::create_from(surface, format, size, size)
        .map_err(|e| anyhow!("could not map surface {}: {}", surface.id(), e))?;
    let va_image = *image.image();

    let width = extent.width as usize;
    let height = extent.height as usize;
    let uv_offset = width * height;
    let mut data = vec![0u8; uv_offset + width * height.div_ceil(2)];

    nv12_copy(
        &mut data,
        width,
        image.as_ref(),
        [va_image.pitches[0] as usize, va_image.pitches[1] as usize],
        [va_image.offsets[0] as usize, va_image.offsets[1] as usize],
        width,
        height,
    )
    .context("while copying out the VA image")?;

    Ok(LinearFrame {
        data,
        extent,
        planes: [
            PlaneInfo {
                offset: 0,
                pitch: width,
            },
            PlaneInfo {
                offset: uv_offset,
                pitch: width,
            },
        ],
    })
}

/// Exports `surface` as a single-object NV12 DMA-buf.
fn export_nv12<M: SurfaceMemoryDescriptor>(
    surface: &Surface<M>,
) -> BackendResult<ExportedSurface> {
    let descriptor = surface
        .export_prime()
        .map_err(|e| anyhow!("could not export surface {}: {}", surface.id(), e))?;

    let layer = descriptor
        .layers
        .first()
        .ok_or(BackendError::Unsupported("dma-buf export without layers"))?;
    let object_index = layer.object_index.map(u32::from);
    if !single_object_planes(
        descriptor.objects.len(),
        descriptor.layers.len(),
        layer.num_planes,
        &object_index,
    ) {
        log::debug!(
            "surface {} exported as {} objects and {} layers",
            surface.id(),
            descriptor.objects.len(),
            descriptor.layers.len()
        );
        return Err(BackendError::Unsupported("multi-object dma-buf export"));
    }

    let pitches = [layer.pitch[0], layer.pitch[1], 0];
    let offsets = [layer.offset[0], layer.offset[1], 0];
    let (width, height, fourcc) = (descriptor.width, descriptor.height, descriptor.fourcc);
    let object = descriptor
        .objects
        .into_iter()
        .next()
        .ok_or(BackendError::Unsupported("dma-buf export without objects"))?;

    Ok(ExportedSurface {
        fd: OwnedFd::from(object.fd),
        width,
        height,
        fourcc: Fourcc::from(fourcc),
        num_planes: 2,
        pitches,
        offsets,
        modifier: object.drm_format_modifier,
    })
}

struct VaDecoder {
    // Must outlive the context.
    _config: Config,
    context: Rc<Context>,
    extent: Resolution,
}

enum VaSurfaceMemory {
    Allocated(Rc<Surface<()>>),
    Imported(Rc<Surface<ImportedImage>>),
}

struct VaSurface {
    memory: VaSurfaceMemory,
    extent: Resolution,
}

pub struct VaapiBackend {
    display: Rc<Display>,
    nv12_format: Option<libva::VAImageFormat>,
    decoders: HashMap<DecoderId, VaDecoder>,
    surfaces: HashMap<SurfaceId, VaSurface>,
    next_decoder_id: u32,
}

// SAFETY: every `Rc` reachable from the backend is owned by it and never handed out, so all the
// reference counts move between threads together. Access is serialized by the device lock.
unsafe impl Send for VaapiBackend {}

impl VaapiBackend {
    /// Opens the VA display on `drm_device`, or the default render node if `None`.
    pub fn open(drm_device: Option<&Path>) -> anyhow::Result<Self> {
        let display = match drm_device {
            Some(path) => Display::open_drm_display(path)
                .map_err(|_| anyhow!("failed to open libva display {:?}", path))?,
            None => Display::open().ok_or_else(|| anyhow!("failed to open libva display"))?,
        };

        let nv12_format = display
            .query_image_formats()
            .context("while querying image formats")?
            .into_iter()
            .find(|format| format.fourcc == libva::VA_FOURCC_NV12);
        if nv12_format.is_none() {
            log::warn!("VA driver cannot map NV12 images, surface readback is unavailable");
        }

        Ok(Self {
            display,
            nv12_format,
            decoders: HashMap::new(),
            surfaces: HashMap::new(),
            next_decoder_id: 1,
        })
    }

    fn surface(&self, surface: SurfaceId) -> BackendResult<&VaSurface> {
        self.surfaces
            .get(&surface)
            .ok_or_else(|| anyhow!("unknown {:?}", surface).into())
    }
}

impl DecoderBackend for VaapiBackend {
    fn kind(&self) -> Backend {
        Backend::VaApi
    }

    fn create_decoder(
        &mut self,
        profile: DecoderProfile,
        extent: Resolution,
        _max_references: u32,
    ) -> BackendResult<DecoderId> {
        let config = self
            .display
            .create_config(
                vec![libva::VAConfigAttrib {
                    type_: libva::VAConfigAttribType::VAConfigAttribRTFormat,
                    value: libva::VA_RT_FORMAT_YUV420,
                }],
                va_profile(profile),
                libva::VAEntrypoint::VAEntrypointVLD,
            )
            .map_err(|e| anyhow!("could not create VAConfig for {:?}: {}", profile, e))?;

        // Render targets are bound per picture.
        let context = self
            .display
            .create_context::<()>(&config, extent.width, extent.height, None, true)
            .map_err(|e| anyhow!("could not create {} VAContext: {}", extent, e))?;

        let id = DecoderId(self.next_decoder_id);
        self.next_decoder_id += 1;
        log::debug!("created VA decoder {:?} ({:?}, {})", id, profile, extent);

        self.decoders.insert(
            id,
            VaDecoder {
                _config: config,
                context,
                extent,
            },
        );

        Ok(id)
    }

    fn destroy_decoder(&mut self, decoder: DecoderId) {
        if self.decoders.remove(&decoder).is_none() {
            log::warn!("destroying unknown VA decoder {:?}", decoder);
        }
    }

    fn create_surface(&mut self, extent: Resolution) -> BackendResult<SurfaceId> {
        let mut surfaces = self
            .display
            .create_surfaces(
                libva::VA_RT_FORMAT_YUV420,
                Some(libva::VA_FOURCC_NV12),
                extent.width,
                extent.height,
                Some(libva::UsageHint::USAGE_HINT_DECODER),
                vec![()],
            )
            .map_err(|e| anyhow!("could not create {} surface: {}", extent, e))?;

        let surface = surfaces.pop().ok_or(BackendError::OutOfResources)?;
        let id = SurfaceId(surface.id());
        self.surfaces.insert(
            id,
            VaSurface {
                memory: VaSurfaceMemory::Allocated(Rc::new(surface)),
                extent,
            },
        );

        Ok(id)
    }

    fn supports_surface_import(&self) -> bool {
        true
    }

    fn import_surface(
        &mut self,
        extent: Resolution,
        dmabuf: DmaBufImport,
    ) -> BackendResult<SurfaceId> {
        let modifier = dmabuf.modifier;
        let mut surfaces = self
            .display
            .create_surfaces(
                libva::VA_RT_FORMAT_YUV420,
                Some(libva::VA_FOURCC_NV12),
                extent.width,
                extent.height,
                Some(libva::UsageHint::USAGE_HINT_DECODER),
                vec![ImportedImage(dmabuf)],
            )
            .map_err(|e| {
                anyhow!("could not import {} surface (modifier {:#x}): {}", extent, modifier, e)
            })?;

        let surface = surfaces.pop().ok_or(BackendError::OutOfResources)?;
        let id = SurfaceId(surface.id());
        log::debug!("imported {} surface {:?} (modifier {:#x})", extent, id, modifier);
        self.surfaces.insert(
            id,
            VaSurface {
                memory: VaSurfaceMemory::Imported(Rc::new(surface)),
                extent,
            },
        );

        Ok(id)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        if self.surfaces.remove(&surface).is_none() {
            log::warn!("destroying unknown VA surface {:?}", surface);
        }
    }

    fn render(
        &mut self,
        decoder: DecoderId,
        target: SurfaceId,
        picture: &BackendPictureParams,
        slices: &[SliceBuffer],
    ) -> BackendResult<()> {
        let BackendPictureParams::VaApi(params) = picture else {
            return Err(anyhow!("VDPAU parameters submitted to VA-API").into());
        };
        let decoder = self
            .decoders
            .get(&decoder)
            .ok_or_else(|| anyhow!("unknown VA decoder {:?}", decoder))?;
        let surface = self.surface(target)?;

        if !decoder.extent.can_contain(surface.extent) {
            return Err(anyhow!(
                "{} target does not fit a {} decoder",
                surface.extent,
                decoder.extent
            )
            .into());
        }

        match &surface.memory {
            VaSurfaceMemory::Allocated(va_surface) => {
                submit_picture(&decoder.context, Rc::clone(va_surface), params, slices)
            }
            VaSurfaceMemory::Imported(va_surface) => {
                submit_picture(&decoder.context, Rc::clone(va_surface), params, slices)
            }
        }
    }

    fn sync(&mut self, surface: SurfaceId) -> BackendResult<()> {
        let res = match &self.surface(surface)?.memory {
            VaSurfaceMemory::Allocated(va_surface) => va_surface.sync(),
            VaSurfaceMemory::Imported(va_surface) => va_surface.sync(),
        };
        res.map_err(|e| anyhow!("vaSyncSurface failed on {:?}: {}", surface, e))?;

        Ok(())
    }

    fn read_surface(
        &mut self,
        surface: SurfaceId,
        extent: Resolution,
    ) -> BackendResult<LinearFrame> {
        let format = self
            .nv12_format
            .ok_or(BackendError::Unsupported("NV12 image mapping"))?;
        let frame = match &self.surface(surface)?.memory {
            VaSurfaceMemory::Allocated(va_surface) => map_nv12(va_surface, format, extent),
            VaSurfaceMemory::Imported(va_surface) => map_nv12(va_surface, format, extent),
        };

        Ok(frame.with_context(|| format!("while reading back {:?}", surface))?)
    }

    fn export_dmabuf(&mut self, surface: SurfaceId) -> BackendResult<ExportedSurface> {
        match &self.surface(surface)?.memory {
            VaSurfaceMemory::Allocated(va_surface) => export_nv12(va_surface),
            VaSurfaceMemory::Imported(va_surface) => export_nv12(va_surface),
        }
    }
}
