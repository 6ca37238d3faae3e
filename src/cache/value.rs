//! Cached records and lookup handles

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

/// Bytes accounted per record beyond key and value
///
/// Covers the record header and the reference counts of the shared
/// allocation.
pub const RECORD_OVERHEAD: u64 =
    (std::mem::size_of::<CachedValue>() + 2 * std::mem::size_of::<usize>()) as u64;

/// A key/value pair stored in one allocation
#[derive(Debug)]
pub struct CachedValue {
    /// Key bytes followed by value bytes
    data: Bytes,
    key_len: usize,
}

impl CachedValue {
    /// Build a shared record from key and value
    pub fn construct(key: &[u8], value: &[u8]) -> Arc<Self> {
        let mut buf = BytesMut::with_capacity(key.len() + value.len());
        buf.put_slice(key);
        buf.put_slice(value);
        Arc::new(Self {
            data: buf.freeze(),
            key_len: key.len(),
        })
    }

    /// Bytes this record is charged against a cache's usage
    pub fn size_for(key: &[u8], value: &[u8]) -> u64 {
        RECORD_OVERHEAD + key.len() as u64 + value.len() as u64
    }

    pub fn key(&self) -> &[u8] {
        &self.data[..self.key_len]
    }

    pub fn value(&self) -> &[u8] {
        &self.data[self.key_len..]
    }

    pub fn key_size(&self) -> usize {
        self.key_len
    }

    pub fn value_size(&self) -> usize {
        self.data.len() - self.key_len
    }

    /// Value as a zero-copy `Bytes` view
    pub fn value_bytes(&self) -> Bytes {
        self.data.slice(self.key_len..)
    }

    /// Bytes charged against cache usage
    pub fn size(&self) -> u64 {
        RECORD_OVERHEAD + self.data.len() as u64
    }
}

/// Read-only handle to a record returned by `find`
///
/// The record stays alive while any handle exists, even after it has been
/// evicted or replaced in the table.
#[derive(Debug, Clone)]
pub struct Finding {
    record: Arc<CachedValue>,
}

impl Finding {
    pub(crate) fn new(record: Arc<CachedValue>) -> Self {
        Self { record }
    }

    pub fn key(&self) -> &[u8] {
        self.record.key()
    }

    pub fn value(&self) -> &[u8] {
        self.record.value()
    }

    pub fn value_bytes(&self) -> Bytes {
        self.record.value_bytes()
    }

    pub fn record(&self) -> &Arc<CachedValue> {
        &self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = CachedValue::construct(b"key", b"value-bytes");
        assert_eq!(record.key(), b"key");
        assert_eq!(record.value(), b"value-bytes");
        assert_eq!(record.key_size(), 3);
        assert_eq!(record.value_size(), 11);
        assert_eq!(record.size(), CachedValue::size_for(b"key", b"value-bytes"));
        assert_eq!(&record.value_bytes()[..], b"value-bytes");
    }

    #[test]
    fn test_finding_outlives_table_reference() {
        let record = CachedValue::construct(b"k", b"v");
        let finding = Finding::new(Arc::clone(&record));
        drop(record);
        assert_eq!(finding.value(), b"v");
        assert_eq!(Arc::strong_count(finding.record()), 1);
    }
}
