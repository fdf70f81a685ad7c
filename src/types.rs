use std::fmt;

/// Handle to an open file managed by the page cache.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a bucket inside a file: page index plus byte offset of the
/// subpage within that page.
///
/// The distinguished [`BucketPointer::NULL`] value `(-1, -1)` marks absence;
/// a pointer is usable iff [`is_valid`](Self::is_valid) holds.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BucketPointer {
    pub page_index: i64,
    pub page_offset: i32,
}

impl BucketPointer {
    /// Sentinel for "no bucket".
    pub const NULL: BucketPointer = BucketPointer {
        page_index: -1,
        page_offset: -1,
    };

    /// Size of the on-disk encoding in bytes.
    pub const ENCODED_LEN: usize = 12;

    pub const fn new(page_index: i64, page_offset: i32) -> Self {
        Self {
            page_index,
            page_offset,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.page_index >= 0
    }

    /// Page index as the cache expects it. Callers must check
    /// [`is_valid`](Self::is_valid) first.
    pub fn page(&self) -> u64 {
        debug_assert!(self.is_valid());
        self.page_index as u64
    }

    /// Byte offset of the bucket within its page.
    pub fn offset(&self) -> usize {
        debug_assert!(self.is_valid());
        self.page_offset as usize
    }

    /// Writes the 12-byte big-endian encoding into `dst`.
    pub fn encode(&self, dst: &mut [u8]) {
        dst[0..8].copy_from_slice(&self.page_index.to_be_bytes());
        dst[8..12].copy_from_slice(&self.page_offset.to_be_bytes());
    }

    /// Reads the 12-byte big-endian encoding from `src`.
    pub fn decode(src: &[u8]) -> Self {
        let page_index = i64::from_be_bytes(src[0..8].try_into().unwrap());
        let page_offset = i32::from_be_bytes(src[8..12].try_into().unwrap());
        Self {
            page_index,
            page_offset,
        }
    }
}

impl fmt::Display for BucketPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_index, self.page_offset)
    }
}

/// Durable handle to one tree: the file it lives in plus its root bucket.
/// Clients persist this to find the tree again after a restart.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CollectionPointer {
    pub file_id: FileId,
    pub root: BucketPointer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_roundtrip() {
        let ptr = BucketPointer::new(42, 2048);
        let mut buf = [0u8; BucketPointer::ENCODED_LEN];
        ptr.encode(&mut buf);
        assert_eq!(BucketPointer::decode(&buf), ptr);
    }

    #[test]
    fn null_pointer_roundtrip_stays_invalid() {
        let mut buf = [0u8; BucketPointer::ENCODED_LEN];
        BucketPointer::NULL.encode(&mut buf);
        let decoded = BucketPointer::decode(&buf);
        assert!(!decoded.is_valid());
        assert_eq!(decoded, BucketPointer::NULL);
    }
}
