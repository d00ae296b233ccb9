//! Guest code access.

#[cfg(feature = "mmap_memory_reader")]
pub mod mmap;

use hashbrown::HashMap;
use thiserror::Error;

/// Guest code pages are 4 KiB.
pub const PAGE_SIZE: usize = 4096;
pub(crate) const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Memory reader giving the graph builder access to guest code bytes.
pub trait ReadMemory {
    /// Error for memory reading
    type Error: std::error::Error;

    /// Borrow the code bytes from `address` up to the end of the 4 KiB page
    /// containing it, and invoke `callback` on them. The borrowed view is
    /// released when the callback returns.
    ///
    /// This function will return the callback return value on success.
    fn map_page<T>(
        &mut self,
        address: u64,
        callback: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, Self::Error>;

    /// Copy `buf.len()` bytes starting at `address` into `buf`, crossing page
    /// boundaries as needed. Fails if any byte is unreadable.
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), Self::Error>;
}

/// Error type for [`SparsePageMemory`]
#[derive(Debug, Error)]
pub enum SparseMemoryError {
    /// The queried address has no page loaded
    #[error("Unmapped guest memory at {0:#x}")]
    Unmapped(u64),
}

/// Page-granular in-memory guest image.
///
/// The simplest [`ReadMemory`] implementor: hosts scatter code bytes into it
/// up front and pages absent from the image read as unmapped.
#[derive(Default)]
pub struct SparsePageMemory {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE]>>,
}

impl SparsePageMemory {
    /// Create an empty image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `bytes` into the image at `address`, materializing zero-filled
    /// pages for every page the span touches.
    #[expect(clippy::cast_possible_truncation)]
    pub fn load(&mut self, address: u64, bytes: &[u8]) {
        let mut address = address;
        let mut bytes = bytes;
        while !bytes.is_empty() {
            let page_base = address & PAGE_MASK;
            let offset = (address - page_base) as usize;
            let chunk_len = usize::min(bytes.len(), PAGE_SIZE - offset);
            let page = self
                .pages
                .entry(page_base)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[offset..offset + chunk_len].copy_from_slice(&bytes[..chunk_len]);
            address += chunk_len as u64;
            bytes = &bytes[chunk_len..];
        }
    }
}

impl ReadMemory for SparsePageMemory {
    type Error = SparseMemoryError;

    #[expect(clippy::cast_possible_truncation)]
    fn map_page<T>(
        &mut self,
        address: u64,
        callback: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, Self::Error> {
        let page_base = address & PAGE_MASK;
        let page = self
            .pages
            .get(&page_base)
            .ok_or(SparseMemoryError::Unmapped(address))?;
        let offset = (address - page_base) as usize;
        Ok(callback(&page[offset..]))
    }

    #[expect(clippy::cast_possible_truncation)]
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
        let mut address = address;
        let mut buf = &mut buf[..];
        while !buf.is_empty() {
            let page_base = address & PAGE_MASK;
            let offset = (address - page_base) as usize;
            let chunk_len = usize::min(buf.len(), PAGE_SIZE - offset);
            let page = self
                .pages
                .get(&page_base)
                .ok_or(SparseMemoryError::Unmapped(address))?;
            buf[..chunk_len].copy_from_slice(&page[offset..offset + chunk_len]);
            address += chunk_len as u64;
            buf = &mut buf[chunk_len..];
        }
        Ok(())
    }
}
