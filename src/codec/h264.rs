// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 parameter structures as handed over by the Vulkan layer (`StdVideoH264*`).
//!
//! These are already parsed by the application, the bridge never looks at the bitstream
//! itself.

use enumn::N;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    High = 100,
    High444Predictive = 244,
}

/// Scaling matrices, in the order used by the bitstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub list_4x4: [[u8; 16]; 6],
    pub list_8x8: [[u8; 64]; 6],
}

impl Default for ScalingLists {
    /// The flat matrices used when the stream does not carry any.
    fn default() -> Self {
        Self {
            list_4x4: [[16; 16]; 6],
            list_8x8: [[16; 64]; 6],
        }
    }
}

/// Sequence parameter set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u32,
    pub level_idc: u32,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub max_num_ref_frames: u8,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,

    pub separate_colour_plane_flag: bool,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub delta_pic_order_always_zero_flag: bool,
}

impl Sps {
    /// Height of a frame in macroblocks, minus one. Interlaced streams code map units as field
    /// macroblock pairs.
    pub fn frame_height_in_mbs_minus1(&self) -> u32 {
        if self.frame_mbs_only_flag {
            self.pic_height_in_map_units_minus1
        } else {
            (self.pic_height_in_map_units_minus1 + 1) * 2 - 1
        }
    }
}

/// Picture parameter set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,

    pub transform_8x8_mode_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub entropy_coding_mode_flag: bool,

    pub scaling_lists: Option<ScalingLists>,
}

/// The SPS and PPS sets of a video session parameters object.
#[derive(Clone, Debug, Default)]
pub struct SessionParameters {
    pub sps: Vec<Sps>,
    pub pps: Vec<Pps>,
}

impl SessionParameters {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds parameter sets, replacing any previous set with the same id.
    pub fn update(&mut self, sps: impl IntoIterator<Item = Sps>, pps: impl IntoIterator<Item = Pps>) {
        for sps in sps {
            match self
                .sps
                .iter_mut()
                .find(|s| s.seq_parameter_set_id == sps.seq_parameter_set_id)
            {
                Some(existing) => *existing = sps,
                None => self.sps.push(sps),
            }
        }

        for pps in pps {
            match self.pps.iter_mut().find(|p| {
                p.seq_parameter_set_id == pps.seq_parameter_set_id
                    && p.pic_parameter_set_id == pps.pic_parameter_set_id
            }) {
                Some(existing) => *existing = pps,
                None => self.pps.push(pps),
            }
        }
    }

    pub fn find_sps(&self, id: u8) -> Option<&Sps> {
        self.sps.iter().find(|sps| sps.seq_parameter_set_id == id)
    }

    pub fn find_pps(&self, id: u8) -> Option<&Pps> {
        self.pps.iter().find(|pps| pps.pic_parameter_set_id == id)
    }
}

/// `StdVideoDecodeH264PictureInfo` plus the slice offsets of `VkVideoDecodeH264PictureInfoKHR`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureInfo {
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub frame_num: u16,
    pub idr_pic_id: u16,
    pub pic_order_cnt: [i32; 2],

    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub is_intra: bool,
    pub is_reference: bool,
    pub idr_pic_flag: bool,

    /// Offset of each slice from the start of the bitstream range.
    pub slice_offsets: Vec<u32>,
}

impl PictureInfo {
    pub fn slice_count(&self) -> usize {
        self.slice_offsets.len()
    }
}

/// `StdVideoDecodeH264ReferenceInfo` of a DPB slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DpbSlotInfo {
    pub frame_num: u16,
    pub pic_order_cnt: [i32; 2],

    pub top_field_flag: bool,
    pub bottom_field_flag: bool,
    pub used_for_long_term_reference: bool,
    pub is_non_existing: bool,
}
