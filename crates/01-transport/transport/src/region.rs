//! Named shared-memory regions backing the task channel.
//!
//! A region is a POSIX shared-memory object (`shm_open`) mapped with
//! `memmap2`. Exactly one process creates it; the peer opens it by name. The
//! creator unlinks the name when its handle drops, while the kernel keeps the
//! pages alive until every process has unmapped them. Dropping any handle only
//! releases the local mapping, so a crashed peer never invalidates ours.

use crate::{TransportError, TransportResult};
use memmap2::{MmapMut, MmapOptions};
use rand::Rng;
use rustix::fs::{fstat, ftruncate, Mode};
use rustix::io::Errno;
use rustix::shm;
use std::fmt;
use std::fs::File;
use std::io;
use std::ptr::NonNull;

/// Longest name accepted by `shm_open` on Linux (NAME_MAX, including the slash).
const MAX_NAME_LEN: usize = 255;

/// Alignment every mapping is guaranteed to honour (page granularity).
pub const REGION_ALIGNMENT: usize = 4096;

/// Validated name of a shared region, e.g. `/rhtq-4242-9f1c0a2b`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegionName(String);

impl RegionName {
    /// Validates an externally supplied name.
    pub fn new(name: impl Into<String>) -> TransportResult<Self> {
        let name = name.into();
        let valid = name.len() > 1
            && name.len() <= MAX_NAME_LEN
            && name.starts_with('/')
            && !name[1..].contains('/')
            && !name.contains('\0');
        if !valid {
            return Err(TransportError::InvalidName { name });
        }
        Ok(Self(name))
    }

    /// Generates a host-unique name scoped by the current pid and a random suffix.
    pub fn unique(prefix: &str) -> TransportResult<Self> {
        let suffix: u64 = rand::thread_rng().gen();
        Self::new(format!("/{prefix}-{}-{suffix:016x}", std::process::id()))
    }

    /// Returns the name including the leading slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the channel owns the OS object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionRole {
    /// Created the object; unlinks the name on drop.
    Creator,
    /// Opened an existing object; only unmaps on drop.
    Opener,
}

/// A mapped, named block of memory visible to both processes.
///
/// All mutation goes through atomics or raw-pointer copies coordinated by the
/// ring protocol, so the region hands out pointers from `&self`.
pub struct SharedRegion {
    name: RegionName,
    role: RegionRole,
    len: usize,
    base: NonNull<u8>,
    // Keeps the mapping alive; `base` points into it.
    _map: MmapMut,
}

// SAFETY: the mapping is process-wide memory; concurrent access is mediated by
// atomics inside the region, never by Rust references to its contents.
unsafe impl Send for SharedRegion {}
// SAFETY: as above, `&SharedRegion` only exposes raw pointers and lengths.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates a new zero-filled region of `size` bytes.
    ///
    /// Fails with `AlreadyExists` if the name is live and `ResourceExhausted`
    /// if the OS cannot back the allocation.
    pub fn create(name: &RegionName, size: usize) -> TransportResult<Self> {
        if size == 0 {
            return Err(TransportError::ResourceExhausted {
                name: name.to_string(),
                size,
                source: io::Error::new(io::ErrorKind::InvalidInput, "zero-sized region"),
            });
        }

        let fd = shm::open(
            name.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|errno| match errno {
            Errno::EXIST => TransportError::AlreadyExists {
                name: name.to_string(),
            },
            other => exhausted_or_os(name, size, other),
        })?;

        if let Err(errno) = ftruncate(&fd, size as u64) {
            let _ = shm::unlink(name.as_str());
            return Err(exhausted_or_os(name, size, errno));
        }

        let file = File::from(fd);
        let map = match map_file(&file, size) {
            Ok(map) => map,
            Err(err) => {
                let _ = shm::unlink(name.as_str());
                return Err(TransportError::ResourceExhausted {
                    name: name.to_string(),
                    size,
                    source: err,
                });
            }
        };

        tracing::debug!(region = %name, size, "created shared region");
        Ok(Self::from_map(name.clone(), RegionRole::Creator, size, map))
    }

    /// Opens an existing region created by the peer.
    pub fn open(name: &RegionName) -> TransportResult<Self> {
        let fd = shm::open(name.as_str(), shm::OFlags::RDWR, Mode::empty()).map_err(|errno| {
            match errno {
                Errno::NOENT => TransportError::NotFound {
                    name: name.to_string(),
                },
                other => TransportError::Os {
                    name: name.to_string(),
                    source: other.into(),
                },
            }
        })?;

        let stat = fstat(&fd).map_err(|errno| TransportError::Os {
            name: name.to_string(),
            source: errno.into(),
        })?;
        let size = usize::try_from(stat.st_size).unwrap_or(0);
        if size == 0 {
            return Err(TransportError::incompatible(format!(
                "region {name} has no backing storage yet"
            )));
        }

        let file = File::from(fd);
        let map = map_file(&file, size).map_err(|source| TransportError::Os {
            name: name.to_string(),
            source,
        })?;

        tracing::debug!(region = %name, size, "opened shared region");
        Ok(Self::from_map(name.clone(), RegionRole::Opener, size, map))
    }

    /// Removes a leftover name, e.g. after a crashed creator. Missing names are ignored.
    pub fn unlink_stale(name: &RegionName) -> TransportResult<()> {
        match shm::unlink(name.as_str()) {
            Ok(()) | Err(Errno::NOENT) => Ok(()),
            Err(errno) => Err(TransportError::Os {
                name: name.to_string(),
                source: errno.into(),
            }),
        }
    }

    fn from_map(name: RegionName, role: RegionRole, len: usize, mut map: MmapMut) -> Self {
        let base = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            name,
            role,
            len,
            base,
            _map: map,
        }
    }

    /// Name the region was created or opened under.
    pub fn name(&self) -> &RegionName {
        &self.name
    }

    /// Whether this handle created the region.
    pub fn role(&self) -> RegionRole {
        self.role
    }

    /// Total number of bytes mapped.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns a typed reference to a `T` living at `offset`.
    ///
    /// # Safety
    ///
    /// `T` must be valid for any bit pattern the peer may have written (plain
    /// integers and atomics), `offset` must be aligned for `T`, and the caller
    /// must not create `&mut` aliases to the same bytes.
    pub unsafe fn view<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.len);
        debug_assert_eq!(
            (self.as_ptr() as usize + offset) % std::mem::align_of::<T>(),
            0
        );
        &*(self.as_ptr().add(offset) as *const T)
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.role == RegionRole::Creator {
            if let Err(errno) = shm::unlink(self.name.as_str()) {
                tracing::warn!(region = %self.name, %errno, "failed to unlink shared region");
            }
        }
    }
}

fn map_file(file: &File, size: usize) -> io::Result<MmapMut> {
    // SAFETY: the object is sized by `ftruncate`/`fstat` and never shrunk by
    // either peer, so the mapping stays valid for its lifetime.
    unsafe { MmapOptions::new().len(size).map_mut(file) }
}

fn exhausted_or_os(name: &RegionName, size: usize, errno: Errno) -> TransportError {
    match errno {
        Errno::NOMEM | Errno::NOSPC | Errno::MFILE | Errno::NFILE | Errno::FBIG => {
            TransportError::ResourceExhausted {
                name: name.to_string(),
                size,
                source: errno.into(),
            }
        }
        other => TransportError::Os {
            name: name.to_string(),
            source: other.into(),
        },
    }
}
