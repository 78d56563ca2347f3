//! Surface capabilities and the allocator interface.
//!
//! A [`SurfaceHandle`] is an opaque reference to a memory-backed image
//! buffer. The protocol moves handles between processes but never maps,
//! reads, or writes them; drawing and display belong to the host.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MFdFlags};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AllocError;

/// Pixel layouts the reference allocator understands.
///
/// Only the fourcc travels on the wire; peers never reinterpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Rgb565,
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

impl PixelFormat {
    /// DRM fourcc code
    pub const fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Argb8888 => fourcc(b"AR24"),
            PixelFormat::Xrgb8888 => fourcc(b"XR24"),
            PixelFormat::Abgr8888 => fourcc(b"AB24"),
            PixelFormat::Rgb565 => fourcc(b"RG16"),
        }
    }

    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb565 => 2,
            _ => 4,
        }
    }
}

/// Geometry and layout metadata that accompanies a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub fourcc: u32,
    /// Total buffer length in bytes
    pub size: u64,
}

/// What the holder of a handle may do with the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Producer's capability
    ReadWrite,
    /// Consumer's display-only capability
    ReadOnly,
}

/// Opaque, transferable capability for one surface.
///
/// Moving a handle moves the capability; there is no `Clone`. The only way
/// to produce a second handle for the same buffer is [`SurfaceHandle::export`],
/// which the producer calls exactly once per slot at setup.
pub struct SurfaceHandle {
    fd: OwnedFd,
    desc: SurfaceDesc,
    access: Access,
}

impl SurfaceHandle {
    pub fn new(fd: OwnedFd, desc: SurfaceDesc, access: Access) -> Self {
        Self { fd, desc, access }
    }

    pub fn desc(&self) -> &SurfaceDesc {
        &self.desc
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Reopen the buffer read-only into a display-only handle for transfer.
    ///
    /// The copy gets its own open file description, so writes and shared
    /// writable mappings through it fail in the receiving process.
    pub fn export(&self) -> std::io::Result<SurfaceHandle> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(format!("/proc/self/fd/{}", self.fd.as_raw_fd()))?;
        Ok(SurfaceHandle {
            fd: file.into(),
            desc: self.desc,
            access: Access::ReadOnly,
        })
    }

    /// Give up the capability, returning the raw resource for transport.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for SurfaceHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("fd", &self.fd.as_raw_fd())
            .field("desc", &self.desc)
            .field("access", &self.access)
            .finish()
    }
}

/// Two handles are equal when they name the same descriptor with the same metadata.
impl PartialEq for SurfaceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.fd.as_raw_fd() == other.fd.as_raw_fd()
            && self.desc == other.desc
            && self.access == other.access
    }
}

impl Eq for SurfaceHandle {}

/// Capability that produces shareable surfaces.
pub trait SurfaceAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<SurfaceHandle, AllocError>;

    /// Return a surface that will not be used, e.g. when pool creation rolls back.
    fn free(&self, handle: SurfaceHandle) {
        drop(handle);
    }
}

/// Allocates surfaces as anonymous memfd files, shareable by fd passing.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemfdAllocator;

impl SurfaceAllocator for MemfdAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<SurfaceHandle, AllocError> {
        if width == 0 || height == 0 {
            return Err(AllocError::InvalidDimensions { width, height });
        }

        let stride = width
            .checked_mul(format.bytes_per_pixel())
            .ok_or(AllocError::SizeOverflow { width, height })?;
        let size = u64::from(stride) * u64::from(height);
        let len = libc::off_t::try_from(size).map_err(|_| AllocError::SizeOverflow { width, height })?;

        let fd = memfd_create(c"handoff-surface", MFdFlags::MFD_CLOEXEC | MFdFlags::MFD_ALLOW_SEALING)?;
        // Newly sized memfds are zero-filled
        nix::unistd::ftruncate(&fd, len)?;
        // Pin the length so receivers can map exactly `size` bytes
        // SAFETY: plain fcntl on a descriptor we own
        Errno::result(unsafe {
            libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, libc::F_SEAL_SHRINK | libc::F_SEAL_GROW)
        })?;

        debug!("Allocated {}x{} surface ({} bytes) as fd {}", width, height, size, fd.as_raw_fd());

        Ok(SurfaceHandle::new(
            fd,
            SurfaceDesc {
                width,
                height,
                stride,
                fourcc: format.fourcc(),
                size,
            },
            Access::ReadWrite,
        ))
    }
}
