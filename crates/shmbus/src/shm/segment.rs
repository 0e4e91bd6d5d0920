//! Session handle over one named segment.

use nix::sys::stat::Mode;

use super::SEGMENT_NAME_MAX;
use super::native::{self, MappedSegment};
use crate::codec::{self, Content, Encoding, Payload};
use crate::error::{IpcError, Result};

/// A live attachment to a named shared-memory segment.
///
/// Capacity is fixed when the handle is created. `close` (or drop) releases the
/// mapping but leaves the name in place for other openers; use
/// [`SharedMemory::unlink`] to remove it.
pub struct SharedMemory {
    name: String,
    capacity: usize,
    segment: Option<MappedSegment>,
}

impl SharedMemory {
    /// Create a new segment of `size` bytes with permission `mode`.
    pub fn create(name: &str, mode: Mode, size: usize) -> Result<Self> {
        check_name(name)?;

        let segment = MappedSegment::create(name, mode, size).map_err(|e| IpcError::CreateFailed {
            name: name.to_string(),
            code: e as i32,
        })?;

        tracing::debug!(name, size, mode = mode.bits(), "Created shared memory");
        Ok(Self::attached(name, segment))
    }

    /// Attach to an existing segment of at least `size` bytes.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        check_name(name)?;

        let segment = MappedSegment::open(name, size).map_err(|e| IpcError::OpenFailed {
            name: name.to_string(),
            code: e as i32,
        })?;

        tracing::debug!(name, size, writable = segment.is_writable(), "Opened shared memory");
        Ok(Self::attached(name, segment))
    }

    fn attached(name: &str, segment: MappedSegment) -> Self {
        Self {
            name: name.to_string(),
            capacity: segment.size(),
            segment: Some(segment),
        }
    }

    /// Remove `name` from the shared-memory namespace. Existing mappings stay valid.
    pub fn unlink(name: &str) -> Result<()> {
        check_name(name)?;
        native::unlink(name).map_err(|e| IpcError::UnlinkFailed {
            name: name.to_string(),
            code: e as i32,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.segment.is_none()
    }

    pub fn is_read_only(&self) -> bool {
        self.segment.as_ref().is_some_and(|s| !s.is_writable())
    }

    /// Encode `value` and copy it to the start of the segment.
    ///
    /// Fails without touching the segment if the encoded value is larger than the
    /// capacity. Bytes past the written length keep their previous contents.
    pub fn write<'a>(&mut self, value: impl Into<Payload<'a>>, encoding: Option<Encoding>) -> Result<()> {
        let capacity = self.capacity;
        let name = &self.name;
        let segment = self.segment.as_mut().ok_or_else(|| IpcError::Closed {
            op: "write",
            subject: name.clone(),
        })?;

        let bytes = codec::encode(value, encoding)?;
        if bytes.len() > capacity {
            return Err(IpcError::SizeExceeded {
                op: "write",
                subject: name.clone(),
                size: bytes.len(),
                capacity,
            });
        }
        if !segment.is_writable() {
            return Err(IpcError::ReadOnly { name: name.clone() });
        }

        segment.write(&bytes).map_err(|_| IpcError::SizeExceeded {
            op: "write",
            subject: name.clone(),
            size: bytes.len(),
            capacity,
        })?;
        tracing::trace!(name = %name, len = bytes.len(), "Wrote shared data");
        Ok(())
    }

    /// Read `byte_length` bytes (default: the whole segment) from offset 0 and decode.
    pub fn read(&self, encoding: Option<Encoding>, byte_length: Option<usize>) -> Result<Content> {
        let segment = self.segment.as_ref().ok_or_else(|| IpcError::Closed {
            op: "read",
            subject: self.name.clone(),
        })?;

        let len = byte_length.unwrap_or_else(|| segment.size());
        let exceeded = || IpcError::SizeExceeded {
            op: "read",
            subject: self.name.clone(),
            size: len,
            capacity: self.capacity,
        };
        if len > self.capacity {
            return Err(exceeded());
        }

        let mut buf = vec![0u8; len];
        segment.read(&mut buf).map_err(|_| exceeded())?;
        Ok(codec::decode(buf, encoding))
    }

    /// Read the whole segment as text, NUL fill removed.
    pub fn read_string(&self, encoding: Encoding) -> Result<String> {
        let content = self.read(Some(encoding), None)?;
        Ok(content.into_text().unwrap_or_default())
    }

    pub fn read_bytes(&self, byte_length: usize) -> Result<Vec<u8>> {
        Ok(self.read(None, Some(byte_length))?.into_bytes())
    }

    /// Release the mapping and descriptor. A second close fails with `AlreadyClosed`.
    pub fn close(&mut self) -> Result<()> {
        let segment = self.segment.take().ok_or_else(|| IpcError::AlreadyClosed {
            subject: self.name.clone(),
        })?;

        tracing::debug!(name = %self.name, "Closing shared memory");
        segment.close().map_err(|e| IpcError::CloseFailed {
            subject: self.name.clone(),
            code: e as i32,
        })
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.segment.is_some()
            && let Err(e) = self.close()
        {
            tracing::warn!(name = %self.name, error = %e, "Failed to close shared memory on drop");
        }
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.len() > SEGMENT_NAME_MAX {
        return Err(IpcError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            limit: SEGMENT_NAME_MAX,
        });
    }
    Ok(())
}
