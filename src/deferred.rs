// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deferred execution of decode commands.
//!
//! Vulkan records `vkCmdDecodeVideoKHR` into a command buffer long before the work runs, and
//! the bitstream buffer may not even be written yet at that point. [`decode_frame`] therefore
//! only prepares the backend parameters and copies the slices out of the bitstream, and the
//! actual backend calls happen in [`execute_deferred`] when the command buffer is submitted.
//!
//! Each [`DeferredCommand`] pins the cache entries of its target and references so their
//! surfaces stay alive until it has run. Dropping a command releases everything it holds.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;

use crate::backend::DecoderId;
use crate::backend::SurfaceId;
use crate::codec::h264::SessionParameters;
use crate::codec::DecodeInfo;
use crate::cross_device::transfer_picture;
use crate::device::ImageId;
use crate::device::VideoDevice;
use crate::session::Session;
use crate::surface_cache::SurfacePin;
use crate::translate::resolve_references;
use crate::translate::translate_picture;
use crate::translate::translate_slices;
use crate::translate::BackendPictureParams;
use crate::translate::SliceBuffer;
use crate::translate::TranslateError;
use crate::utils::wait_sync_fd;
use crate::BridgeError;
use crate::BridgeResult;
use crate::Resolution;

/// State of a [`CommandBuffer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Idle,
    /// Between `begin_video_coding` and `end_video_coding`.
    Recording,
    Executing,
}

/// A decode prepared at record time, run at submission time.
#[derive(Debug)]
pub struct DeferredCommand {
    decoder: DecoderId,
    target: SurfaceId,
    dst_image: ImageId,
    extent: Resolution,
    picture: BackendPictureParams,
    slices: Vec<SliceBuffer>,
    references: Vec<SurfaceId>,
    producer_sync_fd: Option<OwnedFd>,
    _pins: Vec<SurfacePin>,
}

impl DeferredCommand {
    pub fn target(&self) -> SurfaceId {
        self.target
    }

    pub fn dst_image(&self) -> ImageId {
        self.dst_image
    }

    pub fn references(&self) -> &[SurfaceId] {
        &self.references
    }

    pub fn slices(&self) -> &[SliceBuffer] {
        &self.slices
    }
}

/// The video coding state of a Vulkan command buffer.
#[derive(Debug)]
pub struct CommandBuffer {
    state: CommandBufferState,
    /// Session bound by `begin_video_coding`.
    bound_session: Option<u64>,
    /// Session the queued commands were recorded for.
    queued_session: Option<u64>,
    queue: VecDeque<DeferredCommand>,
    max_frames: Option<NonZeroUsize>,
    dropped_frames: u64,
}

impl CommandBuffer {
    /// Creates a command buffer keeping at most `max_frames` decodes between submissions, or
    /// all of them if `None`.
    pub fn new(max_frames: Option<NonZeroUsize>) -> Self {
        Self {
            state: CommandBufferState::Idle,
            bound_session: None,
            queued_session: None,
            queue: VecDeque::new(),
            max_frames,
            dropped_frames: 0,
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn pending(&self) -> impl Iterator<Item = &DeferredCommand> {
        self.queue.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Number of decodes dropped because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Starts recording video commands for `session`.
    pub fn begin_video_coding(&mut self, session: &Session) -> BridgeResult<()> {
        if self.state != CommandBufferState::Idle {
            return Err(BridgeError::InvalidState("begin_video_coding while not idle"));
        }
        if self.queued_session.is_some_and(|id| id != session.id()) {
            return Err(BridgeError::InvalidState(
                "command buffer has pending decodes of another session",
            ));
        }

        self.state = CommandBufferState::Recording;
        self.bound_session = Some(session.id());

        Ok(())
    }

    /// Stops recording. Recorded decodes stay queued until [`execute_deferred`].
    pub fn end_video_coding(&mut self) -> BridgeResult<()> {
        if self.state != CommandBufferState::Recording {
            return Err(BridgeError::InvalidState("end_video_coding while not recording"));
        }

        self.state = CommandBufferState::Idle;
        self.bound_session = None;

        Ok(())
    }

    /// Drops every pending decode, as `vkResetCommandBuffer` does.
    pub fn reset(&mut self) {
        if !self.queue.is_empty() {
            log::debug!("dropping {} pending decodes on reset", self.queue.len());
        }

        self.queue.clear();
        self.queued_session = None;
        self.bound_session = None;
        self.state = CommandBufferState::Idle;
    }

    fn push(&mut self, session: u64, command: DeferredCommand) {
        if let Some(max) = self.max_frames {
            while self.queue.len() >= max.get() {
                if let Some(dropped) = self.queue.pop_front() {
                    self.dropped_frames += 1;
                    log::warn!(
                        "more than {} decodes per submission, dropping decode into {:?}",
                        max,
                        dropped.dst_image
                    );
                }
            }
        }

        self.queue.push_back(command);
        self.queued_session = Some(session);
    }
}

/// Records the decode of one picture.
///
/// No backend work is submitted: the decoder and surfaces are set up, the parameters
/// translated and the slices copied out of `bitstream`, which starts at `srcBufferOffset`.
/// `device` owns the destination image, whose memory may become the target surface.
pub fn decode_frame(
    cmd: &mut CommandBuffer,
    session: &mut Session,
    device: &dyn VideoDevice,
    params: &SessionParameters,
    mut info: DecodeInfo,
    bitstream: &Bytes,
) -> BridgeResult<()> {
    if cmd.state != CommandBufferState::Recording || cmd.bound_session != Some(session.id()) {
        return Err(BridgeError::InvalidState("decode outside of video coding scope"));
    }

    let h264 = match info.h264.as_ref() {
        Some(h264) if h264.slice_count() > 0 => h264,
        Some(_) => return Err(BridgeError::FormatNotSupported("picture without slices".into())),
        None => {
            return Err(BridgeError::FormatNotSupported(
                "missing H.264 picture info".into(),
            ))
        }
    };

    let extent = info.coded_extent;
    let decoder = session.ensure_decoder(extent)?;

    // Pin the references first so creating the target cannot evict them.
    let mut pins: Vec<SurfacePin> = info
        .reference_slots
        .iter()
        .filter(|slot| slot.slot_index >= 0)
        .filter_map(|slot| slot.image)
        .filter_map(|image| session.pin(image))
        .collect();

    let target = session.surface_for(info.dst_image, extent, device)?;
    let references = resolve_references(&info.reference_slots, |image| {
        session.lookup_surface(image)
    });

    let picture = translate_picture(session.kind(), params, &info, target, &references)
        .map_err(|e| BridgeError::FormatNotSupported(e.to_string()))?;
    let slices = translate_slices(&picture, h264, info.src_buffer_range, bitstream).map_err(
        |e| match e {
            TranslateError::SliceOutOfBounds { .. } => BridgeError::MemoryMapFailed(e.to_string()),
            e => BridgeError::FormatNotSupported(e.to_string()),
        },
    )?;

    pins.extend(session.pin(info.dst_image));

    log::debug!(
        "recorded decode of {} slices into {:?} ({:?}) with {} references",
        slices.len(),
        info.dst_image,
        target,
        references.len()
    );

    cmd.push(
        session.id(),
        DeferredCommand {
            decoder,
            target,
            dst_image: info.dst_image,
            extent,
            picture,
            slices,
            references: references.iter().map(|r| r.surface).collect(),
            producer_sync_fd: info.producer_sync_fd.take(),
            _pins: pins,
        },
    );

    Ok(())
}

fn run_commands(
    commands: &mut [DeferredCommand],
    session: &mut Session,
    device: &mut dyn VideoDevice,
) -> BridgeResult<()> {
    let backend = Arc::clone(session.backend());
    let fence_timeout = session.config().fence_timeout;

    for command in commands.iter_mut() {
        if let Some(fd) = command.producer_sync_fd.take() {
            if let Err(e) = wait_sync_fd(fd, fence_timeout) {
                log::warn!(
                    "waiting for the bitstream of {:?} failed, decoding anyway: {}",
                    command.dst_image,
                    e
                );
            }
        }

        backend
            .lock()
            .render(
                command.decoder,
                command.target,
                &command.picture,
                &command.slices,
            )
            .map_err(|e| {
                BridgeError::Unknown(anyhow!("render into {:?} failed: {}", command.target, e))
            })?;
    }

    for command in commands.iter() {
        backend.lock().sync(command.target).map_err(|e| {
            BridgeError::Unknown(anyhow!("sync of {:?} failed: {}", command.target, e))
        })?;

        transfer_picture(
            session,
            device,
            command.target,
            command.dst_image,
            command.extent,
        )?;
    }

    Ok(())
}

/// Runs every decode recorded in `cmd`, then writes the pictures into their images.
///
/// The first failure abandons the remaining decodes. In all cases the queue is emptied and
/// `cmd` is idle again on return.
pub fn execute_deferred(
    cmd: &mut CommandBuffer,
    session: &mut Session,
    device: &mut dyn VideoDevice,
) -> BridgeResult<()> {
    if cmd.state != CommandBufferState::Idle {
        return Err(BridgeError::InvalidState("submission of a command buffer still recording"));
    }
    if cmd.queued_session.is_some_and(|id| id != session.id()) {
        return Err(BridgeError::InvalidState("pending decodes belong to another session"));
    }

    cmd.state = CommandBufferState::Executing;
    let mut commands: Vec<_> = cmd.queue.drain(..).collect();
    cmd.queued_session = None;

    let count = commands.len();
    let res = run_commands(&mut commands, session, device);
    drop(commands);
    cmd.state = CommandBufferState::Idle;

    match &res {
        Ok(()) if count > 0 => log::debug!("executed {} deferred decodes", count),
        Ok(()) => (),
        Err(e) => log::error!("deferred decode batch of {} failed: {}", count, e),
    }

    res
}
