//! How a file is split into upload requests.

/// Files at or above this size are uploaded in chunks.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Bytes per chunk request.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// One request carrying the whole file.
    Direct,
    /// `ceil(size / chunk_size)` requests, one per byte range.
    Chunked,
}

/// Pick the upload mode for a file of `size` bytes.
pub fn choose_mode(size: u64, threshold: u64) -> UploadMode {
    if size >= threshold {
        UploadMode::Chunked
    } else {
        UploadMode::Direct
    }
}

/// One byte range of a file and its position in the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub total: u32,
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpan {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.len) as usize
    }
}

/// Split `size` bytes into contiguous spans of at most `chunk_size` bytes.
///
/// Indices run `0..total`; only the last span may be shorter.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    let chunk_size = chunk_size.max(1);
    let total = size.div_ceil(chunk_size) as u32;
    (0..total)
        .map(|index| {
            let offset = index as u64 * chunk_size;
            ChunkSpan {
                index,
                total,
                offset,
                len: chunk_size.min(size - offset),
            }
        })
        .collect()
}
