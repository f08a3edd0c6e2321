use std::fs::File;

use lr_tensor::MappedRegion;
use memmap2::Mmap;

use crate::error::Result;

/// Memory-mapped model file, exposed to backends through the
/// [`MappedRegion`] capability.
pub struct MmapFile {
    mmap: Mmap,
}

impl MmapFile {
    pub fn new(file: &File) -> Result<MmapFile> {
        // safety: the mapping outlives every tensor handle through the
        // model's Arc, and model files are treated as immutable
        let mmap = unsafe { Mmap::map(file)? };
        Ok(MmapFile { mmap })
    }
}

impl MappedRegion for MmapFile {
    fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    #[cfg(unix)]
    fn discard(&self, offset: usize, len: usize) {
        // safety: DONTNEED only drops cached pages; any subsequent read
        // re-populates them from the backing file, which is never mutated.
        if let Err(e) = unsafe {
            self.mmap
                .unchecked_advise_range(memmap2::UncheckedAdvice::DontNeed, offset, len)
        } {
            log::debug!("madvise(DONTNEED) failed: {}", e);
        }
    }

    #[cfg(unix)]
    fn lock(&self) {
        if let Err(e) = self.mmap.lock() {
            log::warn!("failed to lock mapped pages in RAM: {}", e);
        }
    }
}
