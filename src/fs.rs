//! File handles used as the backing store of file-backed pages.
//!
//! The pager reads the content of a file-backed page through a
//! [`RegularFile`] handle. The handle is a thin, cloneable wrapper around any
//! implementation of [`traits::RegularFile`], so the pager does not depend on
//! a particular file system.
//!
//! [`MemoryFile`] is a file whose content lives in memory.
use crate::KernelError;
use alloc::{sync::Arc, vec::Vec};

/// Traits implemented by the file systems.
pub mod traits {
    use crate::KernelError;

    /// A regular file that can be read at an arbitrary position.
    pub trait RegularFile: Send + Sync {
        /// Size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data from the file at `position` into `buf`.
        ///
        /// # Returns
        /// - `Ok(usize)`: The number of bytes read. A number smaller than
        ///   `buf.len()` means the end of the file was reached.
        /// - `Err(KernelError)`: The device failed.
        fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError>;
    }
}

/// A handle to a regular file.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Wraps a file system's file into a handle.
    pub fn new(file: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(file))
    }

    /// Size of the file in bytes.
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads data from the file into the provided buffer.
    ///
    /// # Parameters
    /// - `position`: The byte offset in the file where the read begins.
    /// - `buf`: The buffer to fill.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read.
    /// - `Err(KernelError)`: An error occurred while reading.
    pub fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.0.read(position, buf)
    }

    /// Reads exactly `buf.len()` bytes at `position`.
    ///
    /// Reaching the end of the file before the buffer is full is an
    /// [`KernelError::IOError`].
    pub fn read_exact(&self, mut position: usize, mut buf: &mut [u8]) -> Result<(), KernelError> {
        while !buf.is_empty() {
            match self.read(position, buf)? {
                0 => return Err(KernelError::IOError),
                n => {
                    position += n;
                    buf = &mut buf[n..];
                }
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for RegularFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RegularFile({} bytes)", self.size())
    }
}

/// A read-only file held in memory.
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    /// Creates a file with content `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl traits::RegularFile for MemoryFile {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let start = position.min(self.data.len());
        let end = self.data.len().min(start + buf.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }
}
