// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video capabilities advertised for the bridged H.264 decoder, and the session memory it
//! asks the application to bind.

use thiserror::Error;

use crate::codec::CodecOperation;
use crate::Resolution;

pub const MB_SIZE: u32 = 16;

pub const MIN_BITSTREAM_BUFFER_ALIGNMENT: u64 = 32;
pub const MAX_CODED_EXTENT: Resolution = Resolution {
    width: 4096,
    height: 4096,
};
pub const MIN_CODED_EXTENT: Resolution = Resolution {
    width: MB_SIZE,
    height: MB_SIZE,
};
pub const MAX_DPB_SLOTS: u32 = 17;
pub const MAX_ACTIVE_REFERENCE_PICTURES: u32 = 16;
/// Level 5.1.
pub const MAX_LEVEL_IDC: u32 = 51;

pub const STD_H264_DECODE_EXTENSION_NAME: &str = "VK_STD_vulkan_video_codec_h264_decode";
pub const STD_H264_DECODE_SPEC_VERSION: u32 = 1 << 22;

/// `VkVideoCapabilitiesKHR` and its H.264 decode extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoCapabilities {
    pub min_bitstream_buffer_offset_alignment: u64,
    pub min_bitstream_buffer_size_alignment: u64,
    pub picture_access_granularity: Resolution,
    pub min_coded_extent: Resolution,
    pub max_coded_extent: Resolution,
    pub max_dpb_slots: u32,
    pub max_active_reference_pictures: u32,
    pub max_level_idc: u32,
    pub std_header_name: &'static str,
    pub std_header_version: u32,
}

/// Returns the capabilities for `operation`, or `None` if it is not supported.
pub fn video_capabilities(operation: CodecOperation) -> Option<VideoCapabilities> {
    match operation {
        CodecOperation::DecodeH264 => Some(VideoCapabilities {
            min_bitstream_buffer_offset_alignment: MIN_BITSTREAM_BUFFER_ALIGNMENT,
            min_bitstream_buffer_size_alignment: MIN_BITSTREAM_BUFFER_ALIGNMENT,
            picture_access_granularity: MIN_CODED_EXTENT,
            min_coded_extent: MIN_CODED_EXTENT,
            max_coded_extent: MAX_CODED_EXTENT,
            max_dpb_slots: MAX_DPB_SLOTS,
            max_active_reference_pictures: MAX_ACTIVE_REFERENCE_PICTURES,
            max_level_idc: MAX_LEVEL_IDC,
            std_header_name: STD_H264_DECODE_EXTENSION_NAME,
            std_header_version: STD_H264_DECODE_SPEC_VERSION,
        }),
        _ => None,
    }
}

/// Image tilings a video format can be used with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageTiling {
    Optimal,
    Linear,
}

pub const IMAGE_USAGE_TRANSFER_SRC: u32 = 0x0001;
pub const IMAGE_USAGE_SAMPLED: u32 = 0x0004;
pub const IMAGE_USAGE_VIDEO_DECODE_DST: u32 = 0x0400;
pub const IMAGE_USAGE_VIDEO_DECODE_SRC: u32 = 0x0800;
pub const IMAGE_USAGE_VIDEO_DECODE_DPB: u32 = 0x1000;

/// `VkVideoFormatPropertiesKHR`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoFormatProperties {
    /// Always `VK_FORMAT_G8_B8R8_2PLANE_420_UNORM`, i.e. NV12.
    pub fourcc: crate::Fourcc,
    pub tiling: ImageTiling,
    pub usage: u32,
}

/// Returns the format properties for images with `usage`, used with `operation`.
///
/// Images decoded to by H.264 sessions are linear, so the decoded pictures can be written by
/// the CPU without retiling.
pub fn video_format_properties(operation: CodecOperation, usage: u32) -> VideoFormatProperties {
    let mut usage = usage;
    if usage & IMAGE_USAGE_VIDEO_DECODE_DST != 0 {
        usage |= IMAGE_USAGE_TRANSFER_SRC | IMAGE_USAGE_SAMPLED;
    }

    VideoFormatProperties {
        fourcc: crate::Fourcc::NV12,
        tiling: if operation == CodecOperation::DecodeH264 {
            ImageTiling::Linear
        } else {
            ImageTiling::Optimal
        },
        usage,
    }
}

/// Memory bindings of an H.264 decode session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SessionMemory {
    IntraRowStore = 0,
    DeblockFilterRowStore = 1,
    BsdMpcRowScratch = 2,
    MprRowScratch = 3,
}

pub const SESSION_MEMORY_BINDINGS: usize = 4;
pub const SESSION_MEMORY_ALIGNMENT: u64 = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRequirement {
    pub bind_index: SessionMemory,
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// Returns the memory requirements of an H.264 decode session for pictures up to `max_coded`.
pub fn session_memory_requirements(
    max_coded: Resolution,
    memory_type_count: u32,
) -> [MemoryRequirement; SESSION_MEMORY_BINDINGS] {
    let width_in_mbs = u64::from(max_coded.in_macroblocks().width);
    let memory_type_bits = ((1u64 << memory_type_count.min(32)) - 1) as u32;
    let requirement = |bind_index, size| MemoryRequirement {
        bind_index,
        size,
        alignment: SESSION_MEMORY_ALIGNMENT,
        memory_type_bits,
    };

    [
        requirement(SessionMemory::IntraRowStore, width_in_mbs * 64),
        requirement(SessionMemory::DeblockFilterRowStore, width_in_mbs * 64 * 4),
        requirement(SessionMemory::BsdMpcRowScratch, width_in_mbs * 64 * 2),
        requirement(SessionMemory::MprRowScratch, width_in_mbs * 64 * 2),
    ]
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BindError {
    #[error("expected 4 memory bindings, got {0}")]
    WrongBindingCount(usize),
    #[error("invalid memory bind index {0}")]
    InvalidIndex(u32),
    #[error("memory bind index {0} bound twice")]
    Duplicate(u32),
}

/// A `VkBindVideoSessionMemoryInfoKHR`, without the memory object itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionMemoryBind {
    pub bind_index: u32,
    pub offset: u64,
    pub size: u64,
}

/// Checks the bindings given to `vkBindVideoSessionMemoryKHR` and orders them by binding.
pub fn bind_session_memory(
    binds: &[SessionMemoryBind],
) -> Result<[SessionMemoryBind; SESSION_MEMORY_BINDINGS], BindError> {
    if binds.len() != SESSION_MEMORY_BINDINGS {
        return Err(BindError::WrongBindingCount(binds.len()));
    }

    let mut bound: [Option<SessionMemoryBind>; SESSION_MEMORY_BINDINGS] = Default::default();
    for bind in binds {
        let slot = bound
            .get_mut(bind.bind_index as usize)
            .ok_or(BindError::InvalidIndex(bind.bind_index))?;
        if slot.replace(*bind).is_some() {
            return Err(BindError::Duplicate(bind.bind_index));
        }
    }

    // Four distinct in-range indices fill every slot.
    Ok(bound.map(|bind| bind.unwrap_or(SessionMemoryBind {
        bind_index: 0,
        offset: 0,
        size: 0,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_capabilities() {
        let caps = video_capabilities(CodecOperation::DecodeH264).unwrap();
        assert_eq!(caps.max_coded_extent, Resolution::from((4096, 4096)));
        assert_eq!(caps.min_coded_extent, Resolution::from((16, 16)));
        assert_eq!(caps.max_dpb_slots, 17);
        assert_eq!(caps.max_active_reference_pictures, 16);
        assert_eq!(caps.min_bitstream_buffer_offset_alignment, 32);
        assert_eq!(caps.max_level_idc, 51);

        assert!(video_capabilities(CodecOperation::DecodeH265).is_none());
    }

    #[test]
    fn format_properties() {
        let props = video_format_properties(CodecOperation::DecodeH264, IMAGE_USAGE_VIDEO_DECODE_DST);
        assert_eq!(props.tiling, ImageTiling::Linear);
        assert_eq!(
            props.usage,
            IMAGE_USAGE_VIDEO_DECODE_DST | IMAGE_USAGE_TRANSFER_SRC | IMAGE_USAGE_SAMPLED
        );

        let props = video_format_properties(CodecOperation::Encode, IMAGE_USAGE_VIDEO_DECODE_DPB);
        assert_eq!(props.tiling, ImageTiling::Optimal);
        assert_eq!(props.usage, IMAGE_USAGE_VIDEO_DECODE_DPB);
    }

    #[test]
    fn memory_requirements() {
        // 1920 is 120 macroblocks, 1921 rounds up to 121.
        let reqs = session_memory_requirements(Resolution::from((1921, 1080)), 3);
        let sizes: Vec<_> = reqs.iter().map(|r| r.size).collect();

        assert_eq!(sizes, vec![121 * 64, 121 * 256, 121 * 128, 121 * 128]);
        assert!(reqs.iter().all(|r| r.alignment == 4096 && r.memory_type_bits == 0b111));
        assert_eq!(reqs[1].bind_index, SessionMemory::DeblockFilterRowStore);
    }

    #[test]
    fn memory_binding() {
        let bind = |bind_index| SessionMemoryBind {
            bind_index,
            offset: u64::from(bind_index) * 4096,
            size: 4096,
        };

        let bound = bind_session_memory(&[bind(3), bind(1), bind(0), bind(2)]).unwrap();
        assert_eq!(bound[2].offset, 2 * 4096);

        assert_eq!(
            bind_session_memory(&[bind(0), bind(1)]),
            Err(BindError::WrongBindingCount(2))
        );
        assert_eq!(
            bind_session_memory(&[bind(0), bind(1), bind(2), bind(4)]),
            Err(BindError::InvalidIndex(4))
        );
        assert_eq!(
            bind_session_memory(&[bind(0), bind(1), bind(1), bind(2)]),
            Err(BindError::Duplicate(1))
        );
    }
}
