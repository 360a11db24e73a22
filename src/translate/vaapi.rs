// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VA-API shaped H.264 parameters.
//!
//! These mirror `VAPictureParameterBufferH264`, `VAIQMatrixBufferH264` and
//! `VASliceParameterBufferH264`, but do not depend on libva so they can be built and compared
//! without a driver. The VA-API backend turns them into the actual libva buffers.

use super::PictureTranslator;
use super::ResolvedReference;
use super::TranslateError;
use super::MAX_DPB_REFERENCES;
use super::MAX_FLAT_LIST_ENTRIES;
use crate::backend::SurfaceId;
use crate::codec::h264::PictureInfo;
use crate::codec::h264::Pps;
use crate::codec::h264::ScalingLists;
use crate::codec::h264::Sps;

pub const VA_INVALID_SURFACE: u32 = 0xffff_ffff;

pub const VA_PICTURE_H264_INVALID: u32 = 0x01;
pub const VA_PICTURE_H264_TOP_FIELD: u32 = 0x02;
pub const VA_PICTURE_H264_BOTTOM_FIELD: u32 = 0x04;
pub const VA_PICTURE_H264_SHORT_TERM_REFERENCE: u32 = 0x08;
pub const VA_PICTURE_H264_LONG_TERM_REFERENCE: u32 = 0x10;

pub const VA_SLICE_DATA_FLAG_ALL: u32 = 0x00;

/// `VAPictureH264`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureH264 {
    pub picture_id: u32,
    pub frame_idx: u32,
    pub flags: u32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
}

impl PictureH264 {
    /// Fills array slots there is no picture for.
    pub const INVALID: Self = Self {
        picture_id: VA_INVALID_SURFACE,
        frame_idx: 0,
        flags: VA_PICTURE_H264_INVALID,
        top_field_order_cnt: 0,
        bottom_field_order_cnt: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.picture_id != VA_INVALID_SURFACE && self.flags & VA_PICTURE_H264_INVALID == 0
    }

    fn from_reference(reference: &ResolvedReference) -> Self {
        let info = &reference.info;
        let mut flags = if info.used_for_long_term_reference {
            VA_PICTURE_H264_LONG_TERM_REFERENCE
        } else {
            VA_PICTURE_H264_SHORT_TERM_REFERENCE
        };

        // A frame reference has neither field flag, a complementary field pair has both.
        match (info.top_field_flag, info.bottom_field_flag) {
            (true, false) => flags |= VA_PICTURE_H264_TOP_FIELD,
            (false, true) => flags |= VA_PICTURE_H264_BOTTOM_FIELD,
            _ => (),
        }

        Self {
            picture_id: reference.surface.0,
            frame_idx: u32::from(info.frame_num),
            flags,
            top_field_order_cnt: info.pic_order_cnt[0],
            bottom_field_order_cnt: info.pic_order_cnt[1],
        }
    }
}

/// `seq_fields` of `VAPictureParameterBufferH264`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SeqFields {
    pub chroma_format_idc: u32,
    pub residual_colour_transform_flag: u32,
    pub gaps_in_frame_num_value_allowed_flag: u32,
    pub frame_mbs_only_flag: u32,
    pub mb_adaptive_frame_field_flag: u32,
    pub direct_8x8_inference_flag: u32,
    pub min_luma_bi_pred_size8x8: u32,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub delta_pic_order_always_zero_flag: u32,
}

impl SeqFields {
    /// The packed bitfield as seen by the driver.
    pub fn value(&self) -> u32 {
        (self.chroma_format_idc & 0x3)
            | (self.residual_colour_transform_flag & 0x1) << 2
            | (self.gaps_in_frame_num_value_allowed_flag & 0x1) << 3
            | (self.frame_mbs_only_flag & 0x1) << 4
            | (self.mb_adaptive_frame_field_flag & 0x1) << 5
            | (self.direct_8x8_inference_flag & 0x1) << 6
            | (self.min_luma_bi_pred_size8x8 & 0x1) << 7
            | (self.log2_max_frame_num_minus4 & 0xf) << 8
            | (self.pic_order_cnt_type & 0x3) << 12
            | (self.log2_max_pic_order_cnt_lsb_minus4 & 0xf) << 14
            | (self.delta_pic_order_always_zero_flag & 0x1) << 18
    }
}

/// `pic_fields` of `VAPictureParameterBufferH264`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PicFields {
    pub entropy_coding_mode_flag: u32,
    pub weighted_pred_flag: u32,
    pub weighted_bipred_idc: u32,
    pub transform_8x8_mode_flag: u32,
    pub field_pic_flag: u32,
    pub constrained_intra_pred_flag: u32,
    pub pic_order_present_flag: u32,
    pub deblocking_filter_control_present_flag: u32,
    pub redundant_pic_cnt_present_flag: u32,
    pub reference_pic_flag: u32,
}

impl PicFields {
    /// The packed bitfield as seen by the driver.
    pub fn value(&self) -> u32 {
        (self.entropy_coding_mode_flag & 0x1)
            | (self.weighted_pred_flag & 0x1) << 1
            | (self.weighted_bipred_idc & 0x3) << 2
            | (self.transform_8x8_mode_flag & 0x1) << 4
            | (self.field_pic_flag & 0x1) << 5
            | (self.constrained_intra_pred_flag & 0x1) << 6
            | (self.pic_order_present_flag & 0x1) << 7
            | (self.deblocking_filter_control_present_flag & 0x1) << 8
            | (self.redundant_pic_cnt_present_flag & 0x1) << 9
            | (self.reference_pic_flag & 0x1) << 10
    }
}

/// `VAIQMatrixBufferH264`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IqMatrix {
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 2],
}

impl From<&ScalingLists> for IqMatrix {
    fn from(lists: &ScalingLists) -> Self {
        Self {
            scaling_list_4x4: lists.list_4x4,
            scaling_list_8x8: [lists.list_8x8[0], lists.list_8x8[1]],
        }
    }
}

/// `VAPictureParameterBufferH264`, along with the IQ matrix submitted with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureParams {
    pub curr_pic: PictureH264,
    pub reference_frames: [PictureH264; MAX_DPB_REFERENCES],
    pub picture_width_in_mbs_minus1: u16,
    pub picture_height_in_mbs_minus1: u16,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub num_ref_frames: u8,
    pub seq_fields: SeqFields,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub pic_fields: PicFields,
    pub frame_num: u16,
    pub iq_matrix: IqMatrix,
}

impl PictureParams {
    /// Parameters carrying only `curr_pic`, with no reference and zeroed stream parameters.
    pub fn invalid(curr_pic: PictureH264) -> Self {
        Self {
            curr_pic,
            reference_frames: [PictureH264::INVALID; MAX_DPB_REFERENCES],
            picture_width_in_mbs_minus1: 0,
            picture_height_in_mbs_minus1: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            num_ref_frames: 0,
            seq_fields: Default::default(),
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            second_chroma_qp_index_offset: 0,
            pic_fields: Default::default(),
            frame_num: 0,
            iq_matrix: IqMatrix::from(&ScalingLists::default()),
        }
    }

    /// The valid leading entries of `reference_frames`.
    pub fn valid_references(&self) -> impl Iterator<Item = &PictureH264> {
        self.reference_frames.iter().take_while(|pic| pic.is_valid())
    }
}

/// `VASliceParameterBufferH264`.
///
/// The driver parses the slice header itself, so only the data location and the initial
/// reference lists are provided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceParams {
    pub slice_data_size: u32,
    pub slice_data_offset: u32,
    pub slice_data_flag: u32,
    pub ref_pic_list_0: [PictureH264; MAX_FLAT_LIST_ENTRIES],
    pub ref_pic_list_1: [PictureH264; MAX_FLAT_LIST_ENTRIES],
}

/// Narrows a macroblock count to the 16 bits VA-API has for it.
fn mbs_minus1(field: &'static str, value: u32) -> Result<u16, TranslateError> {
    u16::try_from(value).map_err(|_| TranslateError::OutOfRange { field, value })
}

/// Builds VA-API parameters.
pub struct VaapiTranslator;

impl VaapiTranslator {
    /// The current picture used when the parameter sets are missing.
    pub fn invalid_picture(target: SurfaceId) -> PictureH264 {
        PictureH264 {
            picture_id: target.0,
            ..PictureH264::INVALID
        }
    }
}

impl PictureTranslator for VaapiTranslator {
    type Picture = PictureParams;
    type Slice = SliceParams;

    fn translate_picture(
        sps: &Sps,
        pps: &Pps,
        h264: &PictureInfo,
        is_reference: bool,
        target: SurfaceId,
        references: &[ResolvedReference],
    ) -> Result<PictureParams, TranslateError> {
        let curr_pic = PictureH264 {
            frame_idx: u32::from(h264.frame_num),
            flags: if is_reference {
                VA_PICTURE_H264_SHORT_TERM_REFERENCE
            } else {
                0
            },
            top_field_order_cnt: h264.pic_order_cnt[0],
            bottom_field_order_cnt: h264.pic_order_cnt[1],
            ..Self::invalid_picture(target)
        };

        let mut reference_frames = [PictureH264::INVALID; MAX_DPB_REFERENCES];
        for (slot, reference) in reference_frames.iter_mut().zip(references) {
            *slot = PictureH264::from_reference(reference);
        }

        let seq_fields = SeqFields {
            chroma_format_idc: u32::from(sps.chroma_format_idc),
            residual_colour_transform_flag: 0,
            gaps_in_frame_num_value_allowed_flag: sps.gaps_in_frame_num_value_allowed_flag as u32,
            frame_mbs_only_flag: sps.frame_mbs_only_flag as u32,
            mb_adaptive_frame_field_flag: sps.mb_adaptive_frame_field_flag as u32,
            direct_8x8_inference_flag: sps.direct_8x8_inference_flag as u32,
            min_luma_bi_pred_size8x8: 0,
            log2_max_frame_num_minus4: u32::from(sps.log2_max_frame_num_minus4),
            pic_order_cnt_type: u32::from(sps.pic_order_cnt_type),
            log2_max_pic_order_cnt_lsb_minus4: u32::from(sps.log2_max_pic_order_cnt_lsb_minus4),
            delta_pic_order_always_zero_flag: sps.delta_pic_order_always_zero_flag as u32,
        };

        // Field pictures are decoded as frames, the driver works it out from the slice header.
        let pic_fields = PicFields {
            entropy_coding_mode_flag: pps.entropy_coding_mode_flag as u32,
            weighted_pred_flag: pps.weighted_pred_flag as u32,
            weighted_bipred_idc: u32::from(pps.weighted_bipred_idc),
            transform_8x8_mode_flag: pps.transform_8x8_mode_flag as u32,
            field_pic_flag: 0,
            constrained_intra_pred_flag: pps.constrained_intra_pred_flag as u32,
            pic_order_present_flag: pps.bottom_field_pic_order_in_frame_present_flag as u32,
            deblocking_filter_control_present_flag: pps.deblocking_filter_control_present_flag
                as u32,
            redundant_pic_cnt_present_flag: pps.redundant_pic_cnt_present_flag as u32,
            reference_pic_flag: 1,
        };

        let iq_matrix = match &pps.scaling_lists {
            Some(lists) => IqMatrix::from(lists),
            None => IqMatrix::from(&ScalingLists::default()),
        };

        Ok(PictureParams {
            curr_pic,
            reference_frames,
            picture_width_in_mbs_minus1: mbs_minus1(
                "pic_width_in_mbs_minus1",
                sps.pic_width_in_mbs_minus1,
            )?,
            picture_height_in_mbs_minus1: mbs_minus1(
                "frame_height_in_mbs_minus1",
                sps.frame_height_in_mbs_minus1(),
            )?,
            bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
            num_ref_frames: sps.max_num_ref_frames,
            seq_fields,
            pic_init_qp_minus26: pps.pic_init_qp_minus26,
            pic_init_qs_minus26: pps.pic_init_qs_minus26,
            chroma_qp_index_offset: pps.chroma_qp_index_offset,
            second_chroma_qp_index_offset: pps.second_chroma_qp_index_offset,
            pic_fields,
            frame_num: h264.frame_num,
            iq_matrix,
        })
    }

    fn translate_slice(picture: &PictureParams, offset: u32, size: u32) -> SliceParams {
        let mut ref_pic_list_0 = [PictureH264::INVALID; MAX_FLAT_LIST_ENTRIES];

        // The driver applies the list modifications of the slice header on top of this
        // initial list, so both lists start as the whole DPB.
        for (slot, pic) in ref_pic_list_0.iter_mut().zip(picture.valid_references()) {
            *slot = *pic;
        }

        SliceParams {
            slice_data_size: size,
            slice_data_offset: offset,
            slice_data_flag: VA_SLICE_DATA_FLAG_ALL,
            ref_pic_list_0,
            ref_pic_list_1: ref_pic_list_0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::DpbSlotInfo;
    use crate::translate::tests::test_parameters;

    fn reference(surface: u32, info: DpbSlotInfo) -> ResolvedReference {
        ResolvedReference {
            slot_index: surface as i32,
            surface: SurfaceId(surface),
            info,
        }
    }

    fn translate(is_reference: bool, references: &[ResolvedReference]) -> PictureParams {
        let params = test_parameters();
        let h264 = PictureInfo {
            frame_num: 3,
            pic_order_cnt: [6, 7],
            slice_offsets: vec![0],
            ..Default::default()
        };
        VaapiTranslator::translate_picture(
            &params.sps[0],
            &params.pps[0],
            &h264,
            is_reference,
            SurfaceId(42),
            references,
        )
        .unwrap()
    }

    #[test]
    fn current_picture() {
        let picture = translate(true, &[]);
        assert_eq!(
            picture.curr_pic,
            PictureH264 {
                picture_id: 42,
                frame_idx: 3,
                flags: VA_PICTURE_H264_SHORT_TERM_REFERENCE,
                top_field_order_cnt: 6,
                bottom_field_order_cnt: 7,
            }
        );
        assert_eq!(translate(false, &[]).curr_pic.flags, 0);
        assert!(picture.reference_frames.iter().all(|pic| !pic.is_valid()));

        let invalid = VaapiTranslator::invalid_picture(SurfaceId(42));
        assert_eq!(invalid.picture_id, 42);
        assert_eq!(invalid.flags, VA_PICTURE_H264_INVALID);
    }

    #[test]
    fn sequence_and_picture_fields() {
        let picture = translate(false, &[]);

        assert_eq!(picture.picture_width_in_mbs_minus1, 119);
        assert_eq!(picture.picture_height_in_mbs_minus1, 67);
        assert_eq!(picture.num_ref_frames, 4);
        assert_eq!(picture.pic_init_qp_minus26, -3);
        assert_eq!(picture.second_chroma_qp_index_offset, -1);

        // chroma_format_idc = 1, frame_mbs_only, direct_8x8, log2_max_frame_num_minus4 = 2,
        // log2_max_pic_order_cnt_lsb_minus4 = 4.
        assert_eq!(
            picture.seq_fields.value(),
            1 | 1 << 4 | 1 << 6 | 2 << 8 | 4 << 14
        );
        // CABAC, bipred idc 2, 8x8 transform, pic order present, deblocking control,
        // reference.
        assert_eq!(
            picture.pic_fields.value(),
            1 | 2 << 2 | 1 << 4 | 1 << 7 | 1 << 8 | 1 << 10
        );

        assert_eq!(picture.iq_matrix.scaling_list_4x4, [[16; 16]; 6]);
        assert_eq!(picture.iq_matrix.scaling_list_8x8, [[16; 64]; 2]);
    }

    #[test]
    fn oversized_macroblock_counts_are_rejected() {
        let params = test_parameters();
        let mut sps = params.sps[0].clone();
        sps.pic_width_in_mbs_minus1 = 70000;
        let h264 = PictureInfo {
            slice_offsets: vec![0],
            ..Default::default()
        };
        let translate = |sps: &Sps| {
            VaapiTranslator::translate_picture(sps, &params.pps[0], &h264, false, SurfaceId(1), &[])
        };

        assert_eq!(
            translate(&sps),
            Err(TranslateError::OutOfRange {
                field: "pic_width_in_mbs_minus1",
                value: 70000,
            })
        );

        sps.pic_width_in_mbs_minus1 = 119;
        sps.frame_mbs_only_flag = false;
        sps.pic_height_in_map_units_minus1 = 40000;
        assert!(matches!(
            translate(&sps),
            Err(TranslateError::OutOfRange {
                field: "frame_height_in_mbs_minus1",
                ..
            })
        ));
    }

    #[test]
    fn reference_flags() {
        let references = [
            reference(1, DpbSlotInfo::default()),
            reference(
                2,
                DpbSlotInfo {
                    top_field_flag: true,
                    ..Default::default()
                },
            ),
            reference(
                3,
                DpbSlotInfo {
                    bottom_field_flag: true,
                    used_for_long_term_reference: true,
                    ..Default::default()
                },
            ),
            reference(
                4,
                DpbSlotInfo {
                    top_field_flag: true,
                    bottom_field_flag: true,
                    frame_num: 9,
                    pic_order_cnt: [18, 19],
                    ..Default::default()
                },
            ),
        ];
        let picture = translate(true, &references);
        let flags: Vec<_> = picture.valid_references().map(|pic| pic.flags).collect();

        assert_eq!(
            flags,
            vec![
                VA_PICTURE_H264_SHORT_TERM_REFERENCE,
                VA_PICTURE_H264_SHORT_TERM_REFERENCE | VA_PICTURE_H264_TOP_FIELD,
                VA_PICTURE_H264_LONG_TERM_REFERENCE | VA_PICTURE_H264_BOTTOM_FIELD,
                VA_PICTURE_H264_SHORT_TERM_REFERENCE,
            ]
        );
        assert_eq!(picture.reference_frames[3].frame_idx, 9);
        assert_eq!(picture.reference_frames[3].bottom_field_order_cnt, 19);
        assert!(!picture.reference_frames[4].is_valid());
    }

    #[test]
    fn slice_reference_lists() {
        let references: Vec<_> = (0..16)
            .map(|i| reference(i, DpbSlotInfo::default()))
            .collect();
        let picture = translate(true, &references);
        let slice = VaapiTranslator::translate_slice(&picture, 128, 64);

        assert_eq!(slice.slice_data_offset, 128);
        assert_eq!(slice.slice_data_size, 64);
        assert_eq!(slice.slice_data_flag, VA_SLICE_DATA_FLAG_ALL);
        assert_eq!(&slice.ref_pic_list_0[..16], &picture.reference_frames[..]);
        assert!(slice.ref_pic_list_0[16..].iter().all(|pic| !pic.is_valid()));
        assert_eq!(slice.ref_pic_list_0, slice.ref_pic_list_1);
    }
}
