// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VDPAU H.264 parameters.
//!
//! VDPAU takes a single `VdpPictureInfoH264` per picture and parses the slice headers itself,
//! so the structures here are laid out exactly like the C ones and passed by pointer.

use super::PictureTranslator;
use super::ResolvedReference;
use super::TranslateError;
use super::MAX_DPB_REFERENCES;
use crate::backend::SurfaceId;
use crate::codec::h264::PictureInfo;
use crate::codec::h264::Pps;
use crate::codec::h264::ScalingLists;
use crate::codec::h264::Sps;

pub const VDP_INVALID_HANDLE: u32 = 0xffff_ffff;
pub const VDP_FALSE: i32 = 0;
pub const VDP_TRUE: i32 = 1;

/// `VdpReferenceFrameH264`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReferenceFrameH264 {
    pub surface: u32,
    pub is_long_term: i32,
    pub top_is_reference: i32,
    pub bottom_is_reference: i32,
    pub field_order_cnt: [i32; 2],
    pub frame_idx: u16,
}

impl ReferenceFrameH264 {
    pub const INVALID: Self = Self {
        surface: VDP_INVALID_HANDLE,
        is_long_term: VDP_FALSE,
        top_is_reference: VDP_FALSE,
        bottom_is_reference: VDP_FALSE,
        field_order_cnt: [0, 0],
        frame_idx: 0,
    };

    fn from_reference(reference: &ResolvedReference) -> Self {
        let info = &reference.info;
        // Without field flags both fields of the frame are referenced.
        let (top, bottom) = match (info.top_field_flag, info.bottom_field_flag) {
            (false, false) => (true, true),
            flags => flags,
        };

        Self {
            surface: reference.surface.0,
            is_long_term: vdp_bool(info.used_for_long_term_reference),
            top_is_reference: vdp_bool(top),
            bottom_is_reference: vdp_bool(bottom),
            field_order_cnt: info.pic_order_cnt,
            frame_idx: info.frame_num,
        }
    }
}

/// `VdpPictureInfoH264`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureInfoH264 {
    pub slice_count: u32,
    pub field_order_cnt: [i32; 2],
    pub is_reference: i32,
    pub frame_num: u16,
    pub field_pic_flag: u8,
    pub bottom_field_flag: u8,
    pub num_ref_frames: u8,
    pub mb_adaptive_frame_field_flag: u8,
    pub constrained_intra_pred_flag: u8,
    pub weighted_pred_flag: u8,
    pub weighted_bipred_idc: u8,
    pub frame_mbs_only_flag: u8,
    pub transform_8x8_mode_flag: u8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub pic_init_qp_minus26: i8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: u8,
    pub direct_8x8_inference_flag: u8,
    pub entropy_coding_mode_flag: u8,
    pub pic_order_present_flag: u8,
    pub deblocking_filter_control_present_flag: u8,
    pub redundant_pic_cnt_present_flag: u8,
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 2],
    pub reference_frames: [ReferenceFrameH264; MAX_DPB_REFERENCES],
}

fn vdp_bool(value: bool) -> i32 {
    if value {
        VDP_TRUE
    } else {
        VDP_FALSE
    }
}

/// Builds VDPAU parameters.
pub struct VdpauTranslator;

impl VdpauTranslator {
    /// The zeroed picture info used when the parameter sets are missing.
    pub fn invalid_picture() -> PictureInfoH264 {
        PictureInfoH264 {
            slice_count: 0,
            field_order_cnt: [0, 0],
            is_reference: VDP_FALSE,
            frame_num: 0,
            field_pic_flag: 0,
            bottom_field_flag: 0,
            num_ref_frames: 0,
            mb_adaptive_frame_field_flag: 0,
            constrained_intra_pred_flag: 0,
            weighted_pred_flag: 0,
            weighted_bipred_idc: 0,
            frame_mbs_only_flag: 0,
            transform_8x8_mode_flag: 0,
            chroma_qp_index_offset: 0,
            second_chroma_qp_index_offset: 0,
            pic_init_qp_minus26: 0,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: 0,
            direct_8x8_inference_flag: 0,
            entropy_coding_mode_flag: 0,
            pic_order_present_flag: 0,
            deblocking_filter_control_present_flag: 0,
            redundant_pic_cnt_present_flag: 0,
            scaling_lists_4x4: [[0; 16]; 6],
            scaling_lists_8x8: [[0; 64]; 2],
            reference_frames: [ReferenceFrameH264::INVALID; MAX_DPB_REFERENCES],
        }
    }
}

impl PictureTranslator for VdpauTranslator {
    type Picture = PictureInfoH264;
    /// Slices are passed as plain bitstream buffers.
    type Slice = ();

    fn translate_picture(
        sps: &Sps,
        pps: &Pps,
        h264: &PictureInfo,
        _is_reference: bool,
        _target: SurfaceId,
        references: &[ResolvedReference],
    ) -> Result<PictureInfoH264, TranslateError> {
        let mut info = Self::invalid_picture();

        info.num_ref_frames = sps.max_num_ref_frames;
        info.frame_mbs_only_flag = sps.frame_mbs_only_flag as u8;
        info.mb_adaptive_frame_field_flag = sps.mb_adaptive_frame_field_flag as u8;
        info.log2_max_frame_num_minus4 = sps.log2_max_frame_num_minus4;
        info.pic_order_cnt_type = sps.pic_order_cnt_type;
        info.log2_max_pic_order_cnt_lsb_minus4 = sps.log2_max_pic_order_cnt_lsb_minus4;
        info.delta_pic_order_always_zero_flag = sps.delta_pic_order_always_zero_flag as u8;
        info.direct_8x8_inference_flag = sps.direct_8x8_inference_flag as u8;

        info.entropy_coding_mode_flag = pps.entropy_coding_mode_flag as u8;
        info.pic_order_present_flag = pps.bottom_field_pic_order_in_frame_present_flag as u8;
        info.weighted_pred_flag = pps.weighted_pred_flag as u8;
        info.weighted_bipred_idc = pps.weighted_bipred_idc;
        info.deblocking_filter_control_present_flag =
            pps.deblocking_filter_control_present_flag as u8;
        info.redundant_pic_cnt_present_flag = pps.redundant_pic_cnt_present_flag as u8;
        info.transform_8x8_mode_flag = pps.transform_8x8_mode_flag as u8;
        info.constrained_intra_pred_flag = pps.constrained_intra_pred_flag as u8;
        info.chroma_qp_index_offset = pps.chroma_qp_index_offset;
        info.second_chroma_qp_index_offset = pps.second_chroma_qp_index_offset;
        info.pic_init_qp_minus26 = pps.pic_init_qp_minus26;
        info.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        info.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;

        info.slice_count = h264.slice_count() as u32;
        info.frame_num = h264.frame_num;
        info.field_pic_flag = h264.field_pic_flag as u8;
        info.bottom_field_flag = h264.bottom_field_flag as u8;
        info.is_reference = vdp_bool(h264.is_reference);
        info.field_order_cnt = h264.pic_order_cnt;

        let flat = ScalingLists::default();
        let lists = pps.scaling_lists.as_ref().unwrap_or(&flat);
        info.scaling_lists_4x4 = lists.list_4x4;
        info.scaling_lists_8x8 = [lists.list_8x8[0], lists.list_8x8[1]];

        for (slot, reference) in info.reference_frames.iter_mut().zip(references) {
            *slot = ReferenceFrameH264::from_reference(reference);
        }

        Ok(info)
    }

    fn translate_slice(_: &PictureInfoH264, _: u32, _: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::DpbSlotInfo;
    use crate::translate::tests::test_parameters;

    fn picture_info() -> PictureInfo {
        PictureInfo {
            frame_num: 12,
            pic_order_cnt: [24, 25],
            field_pic_flag: true,
            bottom_field_flag: true,
            is_reference: true,
            slice_offsets: vec![0, 200, 400],
            ..Default::default()
        }
    }

    #[test]
    fn picture_fields() {
        let params = test_parameters();
        let info = VdpauTranslator::translate_picture(
            &params.sps[0],
            &params.pps[0],
            &picture_info(),
            true,
            SurfaceId(1),
            &[],
        )
        .unwrap();

        assert_eq!(info.slice_count, 3);
        assert_eq!(info.frame_num, 12);
        assert_eq!(info.field_order_cnt, [24, 25]);
        assert_eq!(info.field_pic_flag, 1);
        assert_eq!(info.bottom_field_flag, 1);
        assert_eq!(info.is_reference, VDP_TRUE);
        assert_eq!(info.num_ref_frames, 4);
        assert_eq!(info.num_ref_idx_l0_active_minus1, 2);
        assert_eq!(info.num_ref_idx_l1_active_minus1, 1);
        assert_eq!(info.weighted_bipred_idc, 2);
        assert_eq!(info.pic_order_present_flag, 1);
        assert_eq!(info.chroma_qp_index_offset, 1);
        assert_eq!(info.scaling_lists_4x4, [[16; 16]; 6]);
        assert_eq!(info.scaling_lists_8x8, [[16; 64]; 2]);
        assert!(info
            .reference_frames
            .iter()
            .all(|r| *r == ReferenceFrameH264::INVALID));
    }

    #[test]
    fn scaling_lists_from_pps() {
        let mut params = test_parameters();
        let mut lists = ScalingLists::default();
        lists.list_4x4[5] = [4; 16];
        lists.list_8x8[1] = [8; 64];
        lists.list_8x8[2] = [9; 64];
        params.pps[0].scaling_lists = Some(lists);

        let info = VdpauTranslator::translate_picture(
            &params.sps[0],
            &params.pps[0],
            &picture_info(),
            true,
            SurfaceId(1),
            &[],
        )
        .unwrap();

        assert_eq!(info.scaling_lists_4x4[5], [4; 16]);
        assert_eq!(info.scaling_lists_4x4[0], [16; 16]);
        assert_eq!(info.scaling_lists_8x8, [[16; 64], [8; 64]]);
    }

    #[test]
    fn reference_fields() {
        let params = test_parameters();
        let references = [
            ResolvedReference {
                slot_index: 0,
                surface: SurfaceId(7),
                info: DpbSlotInfo {
                    frame_num: 4,
                    pic_order_cnt: [8, 9],
                    used_for_long_term_reference: true,
                    ..Default::default()
                },
            },
            ResolvedReference {
                slot_index: 1,
                surface: SurfaceId(8),
                info: DpbSlotInfo {
                    bottom_field_flag: true,
                    ..Default::default()
                },
            },
        ];

        let info = VdpauTranslator::translate_picture(
            &params.sps[0],
            &params.pps[0],
            &picture_info(),
            true,
            SurfaceId(1),
            &references,
        )
        .unwrap();

        assert_eq!(
            info.reference_frames[0],
            ReferenceFrameH264 {
                surface: 7,
                is_long_term: VDP_TRUE,
                top_is_reference: VDP_TRUE,
                bottom_is_reference: VDP_TRUE,
                field_order_cnt: [8, 9],
                frame_idx: 4,
            }
        );
        assert_eq!(info.reference_frames[1].top_is_reference, VDP_FALSE);
        assert_eq!(info.reference_frames[1].bottom_is_reference, VDP_TRUE);
        assert_eq!(info.reference_frames[2], ReferenceFrameH264::INVALID);
    }
}
