//! Memory reader backed by memory-mapped binary images.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use memmap2::{Mmap, MmapOptions};
use thiserror::Error;

use super::{PAGE_MASK, PAGE_SIZE, ReadMemory};

/// Memory reader that reconstructs guest code from binary images mapped from
/// disk.
///
/// The images must be unmodified since the trace was recorded; the reader
/// only replays the load addresses it is given.
pub struct MmapMemoryReader {
    /// Mapped images, sorted by load address for binary search
    entries: Vec<MappedImage>,
}

/// One image mapped into the reconstructed address space.
pub struct MappedImage {
    mmap: Mmap,
    load_address: u64,
}

impl MappedImage {
    /// Get the content of the mapped image
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.mmap
    }

    /// Get the load address of the mapped image
    #[must_use]
    pub fn load_address(&self) -> u64 {
        self.load_address
    }
}

/// Error type for [`MmapMemoryReader`] in the implementation of [`ReadMemory`]
#[derive(Debug, Error)]
pub enum MmapMemoryReaderError {
    /// The queried address falls outside every mapped image
    #[error("Unmapped area {0:#x} accessed")]
    NotMapped(u64),
}

/// Error type for [`MmapMemoryReader`], only used in [`MmapMemoryReader::new`]
#[derive(Debug, Error)]
pub enum MmapMemoryReaderCreateError {
    /// Failed to open or map an image file
    #[error("Failed to map image {}: {source}", path.display())]
    FileIo {
        /// Path of the target file
        path: PathBuf,
        /// Source of error
        #[source]
        source: std::io::Error,
    },
}

impl MmapMemoryReader {
    /// Map each `(path, load_address)` pair read-only.
    pub fn new(
        images: impl IntoIterator<Item = (PathBuf, u64)>,
    ) -> Result<Self, MmapMemoryReaderCreateError> {
        let mut entries = Vec::new();
        for (path, load_address) in images {
            let file = file_io_err(&path, File::open(&path))?;
            // SAFETY: the images are opened read-only and must not be
            // truncated while the session is alive, per the type contract.
            let mmap = file_io_err(&path, unsafe { MmapOptions::new().map(&file) })?;
            log::trace!(
                "Mapped {:016x}--{:016x}\t{}",
                load_address,
                load_address.saturating_add(mmap.len() as u64),
                path.display()
            );
            entries.push(MappedImage { mmap, load_address });
        }
        entries.sort_by_key(|entry| entry.load_address);
        Ok(Self { entries })
    }

    /// Get the mapped images, sorted by load address
    #[must_use]
    pub fn images(&self) -> &[MappedImage] {
        &self.entries
    }

    #[expect(clippy::cast_possible_truncation)]
    fn slice_at(&self, address: u64, max_len: usize) -> Result<&[u8], MmapMemoryReaderError> {
        let pos = match self
            .entries
            .binary_search_by_key(&address, |entry| entry.load_address)
        {
            Ok(pos) => pos,
            Err(0) => return Err(MmapMemoryReaderError::NotMapped(address)),
            Err(pos) => pos - 1,
        };
        let entry = &self.entries[pos];
        let offset = (address - entry.load_address) as usize;
        if offset >= entry.mmap.len() {
            return Err(MmapMemoryReaderError::NotMapped(address));
        }
        let len = usize::min(max_len, entry.mmap.len() - offset);
        Ok(&entry.mmap[offset..offset + len])
    }
}

fn file_io_err<T>(
    path: &Path,
    result: Result<T, std::io::Error>,
) -> Result<T, MmapMemoryReaderCreateError> {
    result.map_err(|source| MmapMemoryReaderCreateError::FileIo {
        path: path.to_path_buf(),
        source,
    })
}

impl ReadMemory for MmapMemoryReader {
    type Error = MmapMemoryReaderError;

    #[expect(clippy::cast_possible_truncation)]
    fn map_page<T>(
        &mut self,
        address: u64,
        callback: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, Self::Error> {
        let page_end = (address & PAGE_MASK) + PAGE_SIZE as u64;
        let slice = self.slice_at(address, (page_end - address) as usize)?;
        Ok(callback(slice))
    }

    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
        let mut address = address;
        let mut buf = &mut buf[..];
        while !buf.is_empty() {
            let chunk = self.slice_at(address, buf.len())?;
            buf[..chunk.len()].copy_from_slice(chunk);
            address += chunk.len() as u64;
            buf = &mut buf[chunk.len()..];
        }
        Ok(())
    }
}
