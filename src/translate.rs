// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Translation of Vulkan H.264 decode parameters into backend parameters.
//!
//! Both backends are fed from the same Vulkan structures but expect differently shaped
//! parameters: VA-API wants `VAPictureParameterBufferH264` and one
//! `VASliceParameterBufferH264` per slice, VDPAU wants a single `VdpPictureInfoH264` and the
//! raw slices. [`PictureTranslator`] is implemented once per shape, and
//! [`translate_picture`]/[`translate_slices`] dispatch on the [`Backend`].
//!
//! Translation is a pure function of its inputs.

pub mod vaapi;
pub mod vdpau;

use bytes::Bytes;
use thiserror::Error;

use crate::backend::Backend;
use crate::backend::DecoderProfile;
use crate::backend::SurfaceId;
use crate::codec::h264::DpbSlotInfo;
use crate::codec::h264::PictureInfo;
use crate::codec::h264::Pps;
use crate::codec::h264::Profile;
use crate::codec::h264::SessionParameters;
use crate::codec::h264::Sps;
use crate::codec::DecodeInfo;
use crate::codec::ReferenceSlot;
use crate::device::ImageId;

/// Number of DPB entries the backends can track.
pub const MAX_DPB_REFERENCES: usize = 16;
/// Number of entries of a flattened reference list (VA-API `RefPicList0/1`).
pub const MAX_FLAT_LIST_ENTRIES: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TranslateError {
    #[error("no H.264 picture info")]
    MissingPictureInfo,
    #[error("SPS {0} not found")]
    MissingSps(u8),
    #[error("PPS {0} not found")]
    MissingPps(u8),
    #[error("no slices to decode")]
    NoSlices,
    #[error("{field} of {value} does not fit the backend parameters")]
    OutOfRange { field: &'static str, value: u32 },
    #[error("slice {index} at offset {offset} does not fit in the {range} bytes bitstream")]
    SliceOutOfBounds {
        index: usize,
        offset: u32,
        range: usize,
    },
}

/// A DPB reference resolved to the backend surface holding it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResolvedReference {
    pub slot_index: i32,
    pub surface: SurfaceId,
    pub info: DpbSlotInfo,
}

/// Parameters of one picture, in the shape expected by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendPictureParams {
    VaApi(Box<vaapi::PictureParams>),
    Vdpau(Box<vdpau::PictureInfoH264>),
}

/// Per-slice parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SliceParams {
    VaApi(Box<vaapi::SliceParams>),
    /// VDPAU only needs the slice bytes.
    Vdpau,
}

/// One slice ready to be handed to the backend, with its own copy of the slice bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceBuffer {
    pub params: SliceParams,
    /// Offset of the slice in the bitstream range.
    pub offset: u32,
    pub data: Bytes,
}

/// A backend-specific translation of the H.264 parameters.
pub trait PictureTranslator {
    type Picture;
    type Slice;

    /// Builds the picture parameters for decoding `h264` into `target`.
    fn translate_picture(
        sps: &Sps,
        pps: &Pps,
        h264: &PictureInfo,
        is_reference: bool,
        target: SurfaceId,
        references: &[ResolvedReference],
    ) -> Result<Self::Picture, TranslateError>;

    /// Builds the parameters of the slice found at `offset` and spanning `size` bytes.
    fn translate_slice(picture: &Self::Picture, offset: u32, size: u32) -> Self::Slice;
}

/// Resolves the reference slots of a decode to backend surfaces.
///
/// Slots are visited in order. Unused slots, slots without a picture or H.264 info, and
/// pictures without a surface are skipped. At most [`MAX_DPB_REFERENCES`] are returned.
pub fn resolve_references(
    slots: &[ReferenceSlot],
    mut surface_of: impl FnMut(ImageId) -> Option<SurfaceId>,
) -> Vec<ResolvedReference> {
    let mut references = Vec::new();

    for slot in slots {
        if references.len() == MAX_DPB_REFERENCES {
            log::warn!("more than {} references, ignoring the rest", MAX_DPB_REFERENCES);
            break;
        }

        if slot.slot_index < 0 {
            continue;
        }

        let (Some(image), Some(info)) = (slot.image, slot.h264) else {
            continue;
        };

        match surface_of(image) {
            Some(surface) => references.push(ResolvedReference {
                slot_index: slot.slot_index,
                surface,
                info,
            }),
            None => log::warn!(
                "reference in slot {} ({:?}) has no surface, dropping it",
                slot.slot_index,
                image
            ),
        }
    }

    references
}

/// Looks up the parameter sets used by `h264`.
fn find_parameter_sets<'a>(
    params: &'a SessionParameters,
    h264: &PictureInfo,
) -> Result<(&'a Sps, &'a Pps), TranslateError> {
    let sps = params
        .find_sps(h264.seq_parameter_set_id)
        .ok_or(TranslateError::MissingSps(h264.seq_parameter_set_id))?;
    let pps = params
        .find_pps(h264.pic_parameter_set_id)
        .ok_or(TranslateError::MissingPps(h264.pic_parameter_set_id))?;

    Ok((sps, pps))
}

/// The picture submitted for `target` when its parameters cannot be translated.
pub fn invalid_picture(backend: Backend, target: SurfaceId) -> BackendPictureParams {
    match backend {
        Backend::VaApi => BackendPictureParams::VaApi(Box::new(vaapi::PictureParams::invalid(
            vaapi::VaapiTranslator::invalid_picture(target),
        ))),
        Backend::Vdpau => {
            BackendPictureParams::Vdpau(Box::new(vdpau::VdpauTranslator::invalid_picture()))
        }
    }
}

/// Translates the picture-level parameters of `info` for `backend`.
pub fn translate_picture(
    backend: Backend,
    params: &SessionParameters,
    info: &DecodeInfo,
    target: SurfaceId,
    references: &[ResolvedReference],
) -> Result<BackendPictureParams, TranslateError> {
    let h264 = info.h264.as_ref().ok_or(TranslateError::MissingPictureInfo)?;
    let (sps, pps) = find_parameter_sets(params, h264).map_err(|e| {
        log::warn!(
            "{}, the picture into {:?} would be {:?}",
            e,
            target,
            invalid_picture(backend, target)
        );
        e
    })?;
    let is_reference = info.has_setup_slot();

    Ok(match backend {
        Backend::VaApi => BackendPictureParams::VaApi(Box::new(
            vaapi::VaapiTranslator::translate_picture(
                sps,
                pps,
                h264,
                is_reference,
                target,
                references,
            )?,
        )),
        Backend::Vdpau => BackendPictureParams::Vdpau(Box::new(
            vdpau::VdpauTranslator::translate_picture(
                sps,
                pps,
                h264,
                is_reference,
                target,
                references,
            )?,
        )),
    })
}

/// Splits `bitstream` into slices following the offsets of `h264`, and builds their parameters.
///
/// `bitstream` starts at the beginning of the bitstream range and must be at least
/// `range` bytes long. Slices are kept in the order given.
pub fn translate_slices(
    picture: &BackendPictureParams,
    h264: &PictureInfo,
    range: usize,
    bitstream: &Bytes,
) -> Result<Vec<SliceBuffer>, TranslateError> {
    if h264.slice_offsets.is_empty() {
        return Err(TranslateError::NoSlices);
    }

    let range = range.min(bitstream.len());
    let mut slices = Vec::with_capacity(h264.slice_offsets.len());

    for (index, &offset) in h264.slice_offsets.iter().enumerate() {
        let out_of_bounds = TranslateError::SliceOutOfBounds {
            index,
            offset,
            range,
        };
        let end = match h264.slice_offsets.get(index + 1) {
            Some(&next) => next as usize,
            None => range,
        };
        let size = end
            .checked_sub(offset as usize)
            .filter(|_| end <= range)
            .ok_or(out_of_bounds)?;
        let size_u32 = u32::try_from(size).map_err(|_| TranslateError::SliceOutOfBounds {
            index,
            offset,
            range,
        })?;

        let params = match picture {
            BackendPictureParams::VaApi(picture) => SliceParams::VaApi(Box::new(
                vaapi::VaapiTranslator::translate_slice(picture, offset, size_u32),
            )),
            BackendPictureParams::Vdpau(picture) => {
                vdpau::VdpauTranslator::translate_slice(picture, offset, size_u32);
                SliceParams::Vdpau
            }
        };

        slices.push(SliceBuffer {
            params,
            offset,
            data: bitstream.slice(offset as usize..end),
        });
    }

    Ok(slices)
}

/// Returns the decoder profile to request from `backend` for an H.264 `profile_idc`.
///
/// Unknown profiles are decoded as Main. Without profile information VA-API defaults to Main and
/// VDPAU to High, which accepts the largest set of streams.
pub fn decoder_profile(backend: Backend, profile_idc: Option<u32>) -> DecoderProfile {
    let Some(idc) = profile_idc else {
        return match backend {
            Backend::VaApi => DecoderProfile::H264Main,
            Backend::Vdpau => DecoderProfile::H264High,
        };
    };

    match (Profile::n(idc), backend) {
        (Some(Profile::Baseline), Backend::VaApi) => DecoderProfile::H264ConstrainedBaseline,
        (Some(Profile::Baseline), Backend::Vdpau) => DecoderProfile::H264Baseline,
        (Some(Profile::Main), _) => DecoderProfile::H264Main,
        (Some(Profile::High), _) => DecoderProfile::H264High,
        (Some(Profile::High444Predictive) | None, _) => {
            log::debug!("unsupported H.264 profile_idc {}, using Main", idc);
            DecoderProfile::H264Main
        }
    }
}
