// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VDPAU backend.
//!
//! `libvdpau` and `libX11` are loaded at runtime so the driver does not link against them.
//! The VDPAU implementation is expected to be `libvdpau_va_gl`, which additionally exports
//! decoded surfaces as DMA-bufs.

use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_void;
use std::ffi::CStr;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;

use anyhow::anyhow;
use anyhow::Context;
use libloading::Library;

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
use crate::config::ReadbackPitch;
use crate::translate::vdpau::PictureInfoH264;
use crate::translate::BackendPictureParams;
use crate::translate::SliceBuffer;
use crate::utils::align_up;
use crate::Fourcc;
use crate::Resolution;

const LIBX11: &str = "libX11.so.6";
const LIBVDPAU: &str = "libvdpau.so.1";
const LIBVDPAU_VA_GL: &str = "libvdpau_va_gl.so.1";

/// Directory holding the bundled `libvdpau_va_gl`.
const BUNDLED_DRIVER_DIR: &str = match option_env!("HASVK_VDPAU_DRIVER_DIR") {
    Some(dir) => dir,
    None => "/usr/lib/vdpau",
};

type VdpStatus = c_int;
type VdpDevice = u32;
type VdpDecoder = u32;
type VdpVideoSurface = u32;

const VDP_STATUS_OK: VdpStatus = 0;
const VDP_STATUS_RESOURCES: VdpStatus = 23;

const VDP_FUNC_ID_GET_ERROR_STRING: u32 = 0;
const VDP_FUNC_ID_DEVICE_DESTROY: u32 = 5;
const VDP_FUNC_ID_VIDEO_SURFACE_CREATE: u32 = 9;
const VDP_FUNC_ID_VIDEO_SURFACE_DESTROY: u32 = 10;
const VDP_FUNC_ID_VIDEO_SURFACE_GET_PARAMETERS: u32 = 11;
const VDP_FUNC_ID_VIDEO_SURFACE_GET_BITS_Y_CB_CR: u32 = 12;
const VDP_FUNC_ID_DECODER_CREATE: u32 = 41;
const VDP_FUNC_ID_DECODER_DESTROY: u32 = 42;
const VDP_FUNC_ID_DECODER_RENDER: u32 = 44;

const VDP_DECODER_PROFILE_H264_BASELINE: u32 = 6;
const VDP_DECODER_PROFILE_H264_MAIN: u32 = 7;
const VDP_DECODER_PROFILE_H264_HIGH: u32 = 8;

const VDP_CHROMA_TYPE_420: u32 = 0;
const VDP_YCBCR_FORMAT_NV12: u32 = 0;

const VDP_BITSTREAM_BUFFER_VERSION: u32 = 0;

/// Pitch alignment of generous surface readbacks. Smaller pitches make some drivers return
/// garbage.
const READBACK_PITCH_ALIGNMENT: usize = 2048;
/// Width in bytes of a Y tile row.
const TILE_ROW_PITCH: usize = 128;

/// `VdpBitstreamBuffer`.
#[repr(C)]
struct VdpBitstreamBuffer {
    struct_version: u32,
    bitstream: *const c_void,
    bitstream_bytes: u32,
}

type XOpenDisplayFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type XCloseDisplayFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type XDefaultScreenFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type VdpGetProcAddressFn = unsafe extern "C" fn(VdpDevice, u32, *mut *mut c_void) -> VdpStatus;
type VdpDeviceCreateX11Fn = unsafe extern "C" fn(
    *mut c_void,
    c_int,
    *mut VdpDevice,
    *mut Option<VdpGetProcAddressFn>,
) -> VdpStatus;
type VdpGetErrorStringFn = unsafe extern "C" fn(VdpStatus) -> *const c_char;
type VdpDeviceDestroyFn = unsafe extern "C" fn(VdpDevice) -> VdpStatus;
type VdpDecoderCreateFn =
    unsafe extern "C" fn(VdpDevice, u32, u32, u32, u32, *mut VdpDecoder) -> VdpStatus;
type VdpDecoderDestroyFn = unsafe extern "C" fn(VdpDecoder) -> VdpStatus;
type VdpDecoderRenderFn = unsafe extern "C" fn(
    VdpDecoder,
    VdpVideoSurface,
    *const c_void,
    u32,
    *const VdpBitstreamBuffer,
) -> VdpStatus;
type VdpVideoSurfaceCreateFn =
    unsafe extern "C" fn(VdpDevice, u32, u32, u32, *mut VdpVideoSurface) -> VdpStatus;
type VdpVideoSurfaceDestroyFn = unsafe extern "C" fn(VdpVideoSurface) -> VdpStatus;
type VdpVideoSurfaceGetParametersFn =
    unsafe extern "C" fn(VdpVideoSurface, *mut u32, *mut u32, *mut u32) -> VdpStatus;
type VdpVideoSurfaceGetBitsYCbCrFn =
    unsafe extern "C" fn(VdpVideoSurface, u32, *const *mut c_void, *const u32) -> VdpStatus;
type VdpVideoSurfaceExportDmaBufFn = unsafe extern "C" fn(
    VdpVideoSurface,
    *mut c_int,
    *mut u32,
    *mut u32,
    *mut u32,
    *mut u32,
    *mut u32,
    *mut u32,
    *mut u64,
) -> VdpStatus;

/// Device-level entry points, resolved through `VdpGetProcAddress`.
struct Functions {
    get_error_string: VdpGetErrorStringFn,
    device_destroy: VdpDeviceDestroyFn,
    decoder_create: VdpDecoderCreateFn,
    decoder_destroy: VdpDecoderDestroyFn,
    decoder_render: VdpDecoderRenderFn,
    surface_create: VdpVideoSurfaceCreateFn,
    surface_destroy: VdpVideoSurfaceDestroyFn,
    surface_get_parameters: VdpVideoSurfaceGetParametersFn,
    surface_get_bits: VdpVideoSurfaceGetBitsYCbCrFn,
}

impl Functions {
    /// # Safety
    ///
    /// `get_proc_address` must be the one returned for `device`.
    unsafe fn resolve(device: VdpDevice, get_proc_address: VdpGetProcAddressFn) -> anyhow::Result<Self> {
        let get = |id: u32| -> anyhow::Result<*mut c_void> {
            let mut func = std::ptr::null_mut();
            // SAFETY: `func` is a valid out pointer.
            let status = unsafe { get_proc_address(device, id, &mut func) };
            if status != VDP_STATUS_OK || func.is_null() {
                return Err(anyhow!("VdpGetProcAddress({}) failed with status {}", id, status));
            }
            Ok(func)
        };

        // SAFETY: each function id is transmuted to the signature VDPAU documents for it.
        unsafe {
            Ok(Self {
                get_error_string: std::mem::transmute(get(VDP_FUNC_ID_GET_ERROR_STRING)?),
                device_destroy: std::mem::transmute(get(VDP_FUNC_ID_DEVICE_DESTROY)?),
                decoder_create: std::mem::transmute(get(VDP_FUNC_ID_DECODER_CREATE)?),
                decoder_destroy: std::mem::transmute(get(VDP_FUNC_ID_DECODER_DESTROY)?),
                decoder_render: std::mem::transmute(get(VDP_FUNC_ID_DECODER_RENDER)?),
                surface_create: std::mem::transmute(get(VDP_FUNC_ID_VIDEO_SURFACE_CREATE)?),
                surface_destroy: std::mem::transmute(get(VDP_FUNC_ID_VIDEO_SURFACE_DESTROY)?),
                surface_get_parameters: std::mem::transmute(get(
                    VDP_FUNC_ID_VIDEO_SURFACE_GET_PARAMETERS,
                )?),
                surface_get_bits: std::mem::transmute(get(
                    VDP_FUNC_ID_VIDEO_SURFACE_GET_BITS_Y_CB_CR,
                )?),
            })
        }
    }
}

/// Environment variables to set before loading `libvdpau` so that it picks the bundled
/// `va_gl` driver, unless the user chose another one.
fn driver_environment(
    var: impl Fn(&str) -> Option<String>,
    bundled_dir: &Path,
) -> Vec<(&'static str, String)> {
    let is_set = |name| var(name).is_some_and(|value| !value.is_empty());
    let mut env = Vec::new();

    if !is_set("VDPAU_DRIVER_PATH") && bundled_dir.is_dir() {
        env.push(("VDPAU_DRIVER_PATH", bundled_dir.to_string_lossy().into_owned()));
    }
    if !is_set("VDPAU_DRIVER") {
        env.push(("VDPAU_DRIVER", String::from("va_gl")));
    }

    env
}

fn vdpau_profile(profile: DecoderProfile) -> u32 {
    match profile {
        DecoderProfile::H264ConstrainedBaseline | DecoderProfile::H264Baseline => {
            VDP_DECODER_PROFILE_H264_BASELINE
        }
        DecoderProfile::H264Main => VDP_DECODER_PROFILE_H264_MAIN,
        DecoderProfile::H264High => VDP_DECODER_PROFILE_H264_HIGH,
    }
}

/// Pitch used to read surfaces of `width` back.
fn readback_pitch(mode: ReadbackPitch, width: u32) -> usize {
    let width = width as usize;
    match mode {
        ReadbackPitch::Generous => {
            align_up(width, READBACK_PITCH_ALIGNMENT).max(READBACK_PITCH_ALIGNMENT)
        }
        ReadbackPitch::TileRow => align_up(width, TILE_ROW_PITCH),
        ReadbackPitch::Exact => width,
    }
}

pub struct VdpauBackend {
    display: *mut c_void,
    device: VdpDevice,
    functions: Functions,
    export_dmabuf: Option<VdpVideoSurfaceExportDmaBufFn>,
    close_display: XCloseDisplayFn,
    readback_pitch: ReadbackPitch,
    // Kept loaded for as long as the function pointers above are in use.
    _driver: Option<Library>,
    _vdpau: Library,
    _x11: Library,
}

// SAFETY: the display and device are only used through `&mut self`, i.e. from one thread at a
// time, which VDPAU and Xlib allow for a display opened without `XInitThreads`.
unsafe impl Send for VdpauBackend {}

impl VdpauBackend {
    /// Opens the default X display and creates a VDPAU device on it. Surfaces are read back
    /// with rows of `readback_pitch`.
    pub fn open(readback_pitch: ReadbackPitch) -> anyhow::Result<Self> {
        for (name, value) in driver_environment(|name| std::env::var(name).ok(), Path::new(BUNDLED_DRIVER_DIR)) {
            log::debug!("setting {}={}", name, value);
            std::env::set_var(name, value);
        }

        // SAFETY: loading these libraries runs no initialization with preconditions.
        let x11 = unsafe { Library::new(LIBX11) }.with_context(|| format!("failed to load {}", LIBX11))?;
        // SAFETY: as above.
        let vdpau =
            unsafe { Library::new(LIBVDPAU) }.with_context(|| format!("failed to load {}", LIBVDPAU))?;

        // SAFETY: the symbols have the signatures declared above.
        let (open_display, close_display, default_screen, device_create) = unsafe {
            (
                *x11.get::<XOpenDisplayFn>(b"XOpenDisplay\0")?,
                *x11.get::<XCloseDisplayFn>(b"XCloseDisplay\0")?,
                *x11.get::<XDefaultScreenFn>(b"XDefaultScreen\0")?,
                *vdpau.get::<VdpDeviceCreateX11Fn>(b"vdp_device_create_x11\0")?,
            )
        };

        // SAFETY: a null name opens the display named by $DISPLAY.
        let display = unsafe { open_display(std::ptr::null()) };
        if display.is_null() {
            return Err(anyhow!("cannot open X display"));
        }

        let mut device = 0;
        let mut get_proc_address = None;
        // SAFETY: `display` is valid and both out pointers point to live locals.
        let status = unsafe {
            device_create(display, default_screen(display), &mut device, &mut get_proc_address)
        };
        let get_proc_address = match (status, get_proc_address) {
            (VDP_STATUS_OK, Some(get_proc_address)) => get_proc_address,
            _ => {
                // SAFETY: `display` was opened above and is not used afterwards.
                unsafe { close_display(display) };
                return Err(anyhow!("vdp_device_create_x11 failed with status {}", status));
            }
        };

        // SAFETY: `get_proc_address` was returned for `device`.
        let functions = match unsafe { Functions::resolve(device, get_proc_address) } {
            Ok(functions) => functions,
            Err(e) => {
                // SAFETY: `display` was opened above and is not used afterwards.
                unsafe { close_display(display) };
                return Err(e);
            }
        };

        // The export entry point is our own extension of libvdpau_va_gl, look for it there.
        // SAFETY: as for the other libraries.
        let driver = unsafe { Library::new(LIBVDPAU_VA_GL) }.ok();
        let export_dmabuf = driver.as_ref().and_then(|driver| {
            // SAFETY: the symbol has the signature declared above.
            unsafe { driver.get::<VdpVideoSurfaceExportDmaBufFn>(b"vdpVideoSurfaceExportDmaBufhasvk\0") }
                .ok()
                .map(|func| *func)
        });
        log::debug!(
            "VDPAU device {} created, dma-buf export {}",
            device,
            if export_dmabuf.is_some() { "available" } else { "unavailable" }
        );

        Ok(Self {
            display,
            device,
            functions,
            export_dmabuf,
            close_display,
            readback_pitch,
            _driver: driver,
            _vdpau: vdpau,
            _x11: x11,
        })
    }

    fn error_string(&self, status: VdpStatus) -> String {
        // SAFETY: VDPAU returns a static string for any status.
        let string = unsafe { (self.functions.get_error_string)(status) };
        if string.is_null() {
            return format!("status {}", status);
        }

        // SAFETY: non-null strings returned by VDPAU are nul-terminated.
        unsafe { CStr::from_ptr(string) }.to_string_lossy().into_owned()
    }

    fn check(&self, status: VdpStatus, what: &str) -> BackendResult<()> {
        match status {
            VDP_STATUS_OK => Ok(()),
            VDP_STATUS_RESOURCES => Err(BackendError::OutOfResources),
            status => Err(anyhow!("{} failed: {}", what, self.error_string(status)).into()),
        }
    }

    fn surface_extent(&self, surface: SurfaceId) -> BackendResult<Resolution> {
        let (mut chroma_type, mut width, mut height) = (0, 0, 0);
        // SAFETY: all out pointers point to live locals.
        let status = unsafe {
            (self.functions.surface_get_parameters)(surface.0, &mut chroma_type, &mut width, &mut height)
        };
        self.check(status, "VdpVideoSurfaceGetParameters")?;

        Ok(Resolution { width, height })
    }
}

impl Drop for VdpauBackend {
    fn drop(&mut self) {
        // SAFETY: the device and display are not used after this point.
        unsafe {
            (self.functions.device_destroy)(self.device);
            (self.close_display)(self.display);
        }
    }
}

impl DecoderBackend for VdpauBackend {
    fn kind(&self) -> Backend {
        Backend::Vdpau
    }

    fn create_decoder(
        &mut self,
        profile: DecoderProfile,
        extent: Resolution,
        max_references: u32,
    ) -> BackendResult<DecoderId> {
        let mut decoder = 0;
        // SAFETY: `decoder` is a valid out pointer.
        let status = unsafe {
            (self.functions.decoder_create)(
                self.device,
                vdpau_profile(profile),
                extent.width,
                extent.height,
                max_references,
                &mut decoder,
            )
        };
        self.check(status, "VdpDecoderCreate")?;

        Ok(DecoderId(decoder))
    }

    fn destroy_decoder(&mut self, decoder: DecoderId) {
        // SAFETY: `decoder` was created by this device.
        let status = unsafe { (self.functions.decoder_destroy)(decoder.0) };
        if let Err(e) = self.check(status, "VdpDecoderDestroy") {
            log::warn!("{}", e);
        }
    }

    fn create_surface(&mut self, extent: Resolution) -> BackendResult<SurfaceId> {
        let mut surface = 0;
        // SAFETY: `surface` is a valid out pointer.
        let status = unsafe {
            (self.functions.surface_create)(
                self.device,
                VDP_CHROMA_TYPE_420,
                extent.width,
                extent.height,
                &mut surface,
            )
        };
        self.check(status, "VdpVideoSurfaceCreate")?;

        Ok(SurfaceId(surface))
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        // SAFETY: `surface` was created by this device.
        let status = unsafe { (self.functions.surface_destroy)(surface.0) };
        if let Err(e) = self.check(status, "VdpVideoSurfaceDestroy") {
            log::warn!("{}", e);
        }
    }

    fn render(
        &mut self,
        decoder: DecoderId,
        target: SurfaceId,
        picture: &BackendPictureParams,
        slices: &[SliceBuffer],
    ) -> BackendResult<()> {
        let BackendPictureParams::Vdpau(picture) = picture else {
            return Err(BackendError::Unsupported("VA-API parameters on a VDPAU decoder"));
        };

        let buffers = slices
            .iter()
            .map(|slice| {
                Ok(VdpBitstreamBuffer {
                    struct_version: VDP_BITSTREAM_BUFFER_VERSION,
                    bitstream: slice.data.as_ptr().cast(),
                    bitstream_bytes: u32::try_from(slice.data.len())
                        .map_err(|_| anyhow!("slice of {} bytes", slice.data.len()))?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let picture: &PictureInfoH264 = picture;
        // SAFETY: `picture` and the slice data outlive the call, and `buffers` holds
        // `buffers.len()` entries.
        let status = unsafe {
            (self.functions.decoder_render)(
                decoder.0,
                target.0,
                (picture as *const PictureInfoH264).cast(),
                buffers.len() as u32,
                buffers.as_ptr(),
            )
        };
        self.check(status, "VdpDecoderRender")
    }

    fn sync(&mut self, _surface: SurfaceId) -> BackendResult<()> {
        // Reading the surface back blocks until decoding has completed.
        Ok(())
    }

    fn read_surface(
        &mut self,
        surface: SurfaceId,
        extent: Resolution,
    ) -> BackendResult<LinearFrame> {
        let surface_extent = self.surface_extent(surface)?;
        if !surface_extent.can_contain(extent) {
            return Err(anyhow!(
                "reading {} out of a {} surface",
                extent,
                surface_extent
            )
            .into());
        }

        let pitch = readback_pitch(self.readback_pitch, surface_extent.width);
        let height = surface_extent.height as usize;
        let uv_offset = pitch * height;
        let mut data = vec![0u8; uv_offset + pitch * height.div_ceil(2)];

        let (y, uv) = data.split_at_mut(uv_offset);
        let planes: [*mut c_void; 2] = [y.as_mut_ptr().cast(), uv.as_mut_ptr().cast()];
        let pitches = [pitch as u32; 2];
        // SAFETY: both planes are large enough for a NV12 picture of the surface size at
        // `pitch`.
        let status = unsafe {
            (self.functions.surface_get_bits)(
                surface.0,
                VDP_YCBCR_FORMAT_NV12,
                planes.as_ptr(),
                pitches.as_ptr(),
            )
        };
        self.check(status, "VdpVideoSurfaceGetBitsYCbCr")?;

        Ok(LinearFrame {
            data,
            extent,
            planes: [
                PlaneInfo { offset: 0, pitch },
                PlaneInfo {
                    offset: uv_offset,
                    pitch,
                },
            ],
        })
    }

    fn export_dmabuf(&mut self, surface: SurfaceId) -> BackendResult<ExportedSurface> {
        let export = self
            .export_dmabuf
            .ok_or(BackendError::Unsupported("dma-buf export"))?;

        let mut fd: c_int = -1;
        let (mut width, mut height, mut fourcc, mut num_planes) = (0, 0, 0, 0);
        let mut pitches = [0u32; 3];
        let mut offsets = [0u32; 3];
        let mut modifier = 0u64;
        // SAFETY: all out pointers point to live locals, the arrays hold 3 entries.
        let status = unsafe {
            export(
                surface.0,
                &mut fd,
                &mut width,
                &mut height,
                &mut fourcc,
                &mut num_planes,
                pitches.as_mut_ptr(),
                offsets.as_mut_ptr(),
                &mut modifier,
            )
        };
        self.check(status, "vdpVideoSurfaceExportDmaBufhasvk")?;
        if fd < 0 {
            return Err(anyhow!("export of {:?} returned no fd", surface).into());
        }

        Ok(ExportedSurface {
            // SAFETY: the caller of the export owns the returned fd.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            width,
            height,
            fourcc: Fourcc::from(fourcc),
            num_planes,
            pitches,
            offsets,
            modifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn driver_environment_respects_user_choice() {
        let dir = std::env::temp_dir();
        let vars = |set: &[(&str, &str)]| {
            let set: HashMap<String, String> =
                set.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            move |name: &str| set.get(name).cloned()
        };

        let env = driver_environment(vars(&[]), &dir);
        assert_eq!(
            env,
            vec![
                ("VDPAU_DRIVER_PATH", dir.to_string_lossy().into_owned()),
                ("VDPAU_DRIVER", String::from("va_gl")),
            ]
        );

        let env = driver_environment(
            vars(&[("VDPAU_DRIVER_PATH", "/opt/vdpau"), ("VDPAU_DRIVER", "nvidia")]),
            &dir,
        );
        assert!(env.is_empty());

        // A missing bundled directory is not forced onto libvdpau, an empty value is unset.
        let env = driver_environment(vars(&[("VDPAU_DRIVER", "")]), Path::new("/nonexistent/vdpau"));
        assert_eq!(env, vec![("VDPAU_DRIVER", String::from("va_gl"))]);
    }

    #[test]
    fn readback_pitches() {
        assert_eq!(readback_pitch(ReadbackPitch::Generous, 16), 2048);
        assert_eq!(readback_pitch(ReadbackPitch::Generous, 1920), 2048);
        assert_eq!(readback_pitch(ReadbackPitch::Generous, 2049), 4096);

        assert_eq!(readback_pitch(ReadbackPitch::TileRow, 1280), 1280);
        assert_eq!(readback_pitch(ReadbackPitch::TileRow, 1300), 1408);
        assert_eq!(readback_pitch(ReadbackPitch::Exact, 1300), 1300);
    }

    #[test]
    fn profiles() {
        assert_eq!(vdpau_profile(DecoderProfile::H264ConstrainedBaseline), 6);
        assert_eq!(vdpau_profile(DecoderProfile::H264Main), 7);
        assert_eq!(vdpau_profile(DecoderProfile::H264High), 8);
    }
}
