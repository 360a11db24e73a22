// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec-independent parts of the Vulkan Video structures consumed by the bridge.

pub mod h264;

use std::os::fd::OwnedFd;

use crate::device::ImageId;
use crate::Resolution;

/// The codec operation of a video profile.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecOperation {
    DecodeH264,
    DecodeH265,
    DecodeAv1,
    Encode,
}

/// A video profile as given at session creation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VideoProfile {
    pub operation: CodecOperation,
    /// `stdProfileIdc` of the chained H.264 profile info, if any.
    pub h264_profile_idc: Option<u32>,
}

impl VideoProfile {
    pub fn h264(profile_idc: u32) -> Self {
        Self {
            operation: CodecOperation::DecodeH264,
            h264_profile_idc: Some(profile_idc),
        }
    }
}

/// A picture resource in a DPB slot.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSlot {
    /// Negative when the slot is not in use.
    pub slot_index: i32,
    pub image: Option<ImageId>,
    pub h264: Option<h264::DpbSlotInfo>,
}

/// Equivalent of `VkVideoDecodeInfoKHR` and its H.264 extension.
#[derive(Debug)]
pub struct DecodeInfo {
    pub dst_image: ImageId,
    /// Coded extent of the destination picture.
    pub coded_extent: Resolution,
    /// Size of the bitstream range, starting at `srcBufferOffset`.
    pub src_buffer_range: usize,
    pub setup_reference_slot: Option<ReferenceSlot>,
    pub reference_slots: Vec<ReferenceSlot>,
    pub h264: Option<h264::PictureInfo>,
    /// Sync file signaled once the producer has finished writing the bitstream.
    pub producer_sync_fd: Option<OwnedFd>,
}

impl DecodeInfo {
    pub fn new(dst_image: ImageId, coded_extent: Resolution, src_buffer_range: usize) -> Self {
        Self {
            dst_image,
            coded_extent,
            src_buffer_range,
            setup_reference_slot: None,
            reference_slots: Vec::new(),
            h264: None,
            producer_sync_fd: None,
        }
    }

    /// Whether a setup reference slot is in use, i.e. the decoded picture becomes a
    /// reference.
    pub fn has_setup_slot(&self) -> bool {
        self.setup_reference_slot
            .as_ref()
            .is_some_and(|slot| slot.slot_index >= 0)
    }
}
