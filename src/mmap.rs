use std::fs::File;

use memmap2::{Mmap, MmapOptions};

use crate::{Error, Result};

/// Read-only mapping over the committed prefix of a frozen segment file.
#[derive(Debug)]
pub struct MmapFile {
    map: Mmap,
    len: usize,
}

impl MmapFile {
    pub fn map(file: &File, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
        }
        // SAFETY: only frozen segments are mapped; nothing writes to them
        // again and the file is only deleted once no view holds the segment.
        let map = unsafe { MmapOptions::new().len(len).map(file)? };
        Ok(Self { map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
