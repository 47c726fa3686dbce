//! Named shared-memory segments backing the host bank of a cross-process
//! connection. The proxy creates a segment and publishes its name through the
//! connect-time map; the kernel-side process attaches by name. The creator
//! unlinks the name on drop, attachers only unmap.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shm segment size must be non-zero")]
    ZeroSize,
    #[error("shm_open({path}): {err}")]
    Open { path: String, err: nix::Error },
    #[error("ftruncate({path}, {size}): {err}")]
    Truncate {
        path: String,
        size: usize,
        err: nix::Error,
    },
    #[error("mmap({path}): {err}")]
    Map { path: String, err: nix::Error },
}

static SHM_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct ShmSegment {
    path: String,
    ptr: *mut c_void,
    size: usize,
    owner: bool,
}

unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a fresh segment with a process-unique name.
    pub fn create(size: usize) -> Result<ShmSegment, ShmError> {
        let path = format!(
            "/ccnet-shm-{}-{}",
            std::process::id(),
            SHM_SEQ.fetch_add(1, Ordering::Relaxed),
        );
        let fd = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|err| ShmError::Open {
            path: path.clone(),
            err,
        })?;
        match Self::map_fd(&path, fd, size, true) {
            Ok(seg) => Ok(seg),
            Err(e) => {
                let _ = shm_unlink(path.as_str());
                Err(e)
            }
        }
    }

    /// Attach to a segment created by another process.
    pub fn attach(path: &str, size: usize) -> Result<ShmSegment, ShmError> {
        let fd = shm_open(path, OFlag::O_RDWR, Mode::empty()).map_err(|err| ShmError::Open {
            path: path.to_string(),
            err,
        })?;
        Self::map_fd(path, fd, size, false)
    }

    fn map_fd(path: &str, fd: i32, size: usize, owner: bool) -> Result<ShmSegment, ShmError> {
        let len = NonZeroUsize::new(size).ok_or(ShmError::ZeroSize)?;
        if owner {
            ftruncate(fd, size as i64).map_err(|err| {
                let _ = close(fd);
                ShmError::Truncate {
                    path: path.to_string(),
                    size,
                    err,
                }
            })?;
        }
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|err| {
            let _ = close(fd);
            ShmError::Map {
                path: path.to_string(),
                err,
            }
        })?;
        let _ = close(fd);
        Ok(ShmSegment {
            path: path.to_string(),
            ptr,
            size,
            owner,
        })
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = munmap(self.ptr, self.size) {
                log::error!("munmap({}): {}", self.path, e);
            }
        }
        if self.owner {
            if let Err(e) = shm_unlink(self.path.as_str()) {
                log::error!("shm_unlink({}): {}", self.path, e);
            }
        }
    }
}
