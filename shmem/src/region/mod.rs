//! Fixed-length byte views over memory-mapped files.

use std::fs::{self, OpenOptions};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::errors::{Result, ShmemError};

/// A memory-mapped file whose length never changes after it is opened.
///
/// Every accessor takes an explicit offset and returns the offset just past
/// what it touched, so sequential fields can be chained.
pub struct MappedRegion {
    path: PathBuf,
    len: usize,
    map: Option<MmapMut>,
}

impl MappedRegion {
    /// Creates a zero-filled file of `len` bytes when `create` is set,
    /// otherwise maps the first `len` bytes of an existing file.
    pub fn open(path: &Path, len: usize, create: bool) -> Result<MappedRegion> {
        if len == 0 {
            return Err(ShmemError::InvalidArgument(format!(
                "{} cannot be mapped with zero length",
                path.display()
            )));
        }
        let file = if create {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| match e.kind() {
                    io::ErrorKind::AlreadyExists => ShmemError::AlreadyExists(path.to_path_buf()),
                    _ => ShmemError::Io(e),
                })?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => ShmemError::NotFound(path.to_path_buf()),
                    _ => ShmemError::Io(e),
                })?
        };
        if create {
            if let Err(e) = file.set_len(len as u64) {
                let _ = fs::remove_file(path);
                return Err(e.into());
            }
        } else {
            let actual = file.metadata()?.len();
            if actual < len as u64 {
                return Err(ShmemError::InvalidArgument(format!(
                    "{} holds {} bytes, smaller than the requested {}",
                    path.display(),
                    actual,
                    len
                )));
            }
        }
        let map = match unsafe { MmapOptions::new().len(len).map_mut(&file) } {
            Ok(v) => v,
            Err(e) => {
                if create {
                    let _ = fs::remove_file(path);
                }
                return Err(e.into());
            }
        };
        Ok(MappedRegion {
            path: path.to_path_buf(),
            len,
            map: Some(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_open(&self) -> bool {
        self.map.is_some()
    }

    /// Releases the mapping. The file stays on disk.
    pub fn close(&mut self) {
        self.map = None;
    }

    /// Closes the mapping and removes the file. A missing file is not an error.
    pub fn delete(&mut self) -> Result<()> {
        self.close();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn span(&self, offset: usize, len: usize) -> Result<Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(offset..end),
            _ => Err(ShmemError::OutOfBounds {
                offset,
                len,
                capacity: self.len,
            }),
        }
    }

    fn bytes(&self) -> Result<&[u8]> {
        self.map.as_deref().ok_or(ShmemError::Closed)
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.map.as_deref_mut().ok_or(ShmemError::Closed)
    }

    /// The whole mapped view.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        self.bytes()
    }

    fn read_array<const N: usize>(&self, offset: usize) -> Result<([u8; N], usize)> {
        let range = self.span(offset, N)?;
        let end = range.end;
        let raw: [u8; N] = self.bytes()?[range]
            .try_into()
            .map_err(|_| ShmemError::OutOfBounds {
                offset,
                len: N,
                capacity: self.len,
            })?;
        Ok((raw, end))
    }

    pub fn read_i32(&self, offset: usize) -> Result<(i32, usize)> {
        let (raw, next) = self.read_array::<4>(offset)?;
        Ok((i32::from_le_bytes(raw), next))
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) -> Result<usize> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn read_f32(&self, offset: usize) -> Result<(f32, usize)> {
        let (raw, next) = self.read_array::<4>(offset)?;
        Ok((f32::from_le_bytes(raw), next))
    }

    pub fn write_f32(&mut self, offset: usize, value: f32) -> Result<usize> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Acquire load of a single flag byte.
    pub fn read_bool(&self, offset: usize) -> Result<(bool, usize)> {
        let range = self.span(offset, 1)?;
        let mem = self.bytes()?;
        // AtomicU8 has the size and alignment of u8, and the byte lies in the mapping.
        let flag = unsafe { &*(mem.as_ptr().add(range.start) as *const AtomicU8) };
        Ok((flag.load(Ordering::Acquire) != 0, range.end))
    }

    /// Release store of a single flag byte; earlier writes are visible to
    /// whoever observes it.
    pub fn write_bool(&mut self, offset: usize, value: bool) -> Result<usize> {
        let range = self.span(offset, 1)?;
        let mem = self.bytes_mut()?;
        let flag = unsafe { &*(mem.as_mut_ptr().add(range.start) as *const AtomicU8) };
        flag.store(value as u8, Ordering::Release);
        Ok(range.end)
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<(Vec<u8>, usize)> {
        let range = self.span(offset, len)?;
        let end = range.end;
        Ok((self.bytes()?[range].to_vec(), end))
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        let range = self.span(offset, data.len())?;
        let end = range.end;
        self.bytes_mut()?[range].copy_from_slice(data);
        Ok(end)
    }
}
