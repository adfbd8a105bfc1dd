use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::entry::IndexEntry;
use crate::errdata;
use crate::error::Result;
use crate::fio::Fio;

/// Free range of the data file, tracked after a slab is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRange {
    offset: i64,
    size: i64,
}

/// Sorted, coalesced free list of data-file ranges, persisted in the lease
/// file. Ranges smaller than `min_size` are not worth tracking and are
/// leaked instead.
#[derive(Debug)]
pub struct FreeList {
    min_size: u32,
    ranges: Vec<FreeRange>,
}

impl FreeList {
    pub fn new(min_size: u32) -> Self {
        Self {
            min_size,
            ranges: Vec::new(),
        }
    }

    /// Takes the front of the first range fitting `size`, keeping any
    /// remainder on the list.
    pub fn allocate(&mut self, size: i64) -> Option<i64> {
        let pos = self.ranges.iter().position(|r| r.size >= size)?;
        let range = &mut self.ranges[pos];
        let offset = range.offset;
        range.offset += size;
        range.size -= size;
        if range.size == 0 {
            self.ranges.remove(pos);
        }
        Some(offset)
    }

    /// Returns a range to the list, merging with adjacent ranges.
    pub fn free(&mut self, offset: i64, size: i64) {
        if size < self.min_size as i64 {
            return;
        }
        let pos = self.ranges.partition_point(|r| r.offset < offset);
        self.ranges.insert(pos, FreeRange { offset, size });

        // Coalesce with the neighbor on each side.
        if pos + 1 < self.ranges.len()
            && self.ranges[pos].offset + self.ranges[pos].size == self.ranges[pos + 1].offset
        {
            self.ranges[pos].size += self.ranges[pos + 1].size;
            self.ranges.remove(pos + 1);
        }
        if pos > 0
            && self.ranges[pos - 1].offset + self.ranges[pos - 1].size == self.ranges[pos].offset
        {
            self.ranges[pos - 1].size += self.ranges[pos].size;
            self.ranges.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4 + self.ranges.len() * 16];
        LittleEndian::write_u32(&mut buf[0..4], self.ranges.len() as u32);
        let mut off = 4;
        for r in &self.ranges {
            LittleEndian::write_i64(&mut buf[off..off + 8], r.offset);
            LittleEndian::write_i64(&mut buf[off + 8..off + 16], r.size);
            off += 16;
        }
        buf
    }

    fn decode(buf: &[u8], min_size: u32) -> Result<Self> {
        if buf.len() < 4 {
            return errdata!("lease record too short");
        }
        let count = LittleEndian::read_u32(&buf[0..4]) as usize;
        if buf.len() < 4 + count * 16 {
            return errdata!("lease record truncated: {count} ranges");
        }
        let mut list = FreeList::new(min_size);
        let mut off = 4;
        for _ in 0..count {
            list.ranges.push(FreeRange {
                offset: LittleEndian::read_i64(&buf[off..off + 8]),
                size: LittleEndian::read_i64(&buf[off + 8..off + 16]),
            });
            off += 16;
        }
        Ok(list)
    }
}

/// The append-only data file of `[topic][value]` slabs plus the free-list
/// persisted in the lease file.
#[derive(Debug)]
pub struct DataFile {
    pub(crate) fio: Fio,
    lease_fio: Fio,
    lease: Mutex<FreeList>,
}

impl DataFile {
    pub fn open(fio: Fio, lease_fio: Fio, min_free_size: u32) -> Result<Self> {
        let lease = if lease_fio.size() == 0 {
            FreeList::new(min_free_size)
        } else {
            let buf = lease_fio.slice(0, lease_fio.size())?;
            FreeList::decode(&buf, min_free_size)?
        };
        Ok(Self {
            fio,
            lease_fio,
            lease: Mutex::new(lease),
        })
    }

    /// Reads the topic and value bytes of an entry record.
    pub fn read_message(&self, e: &IndexEntry) -> Result<(Vec<u8>, Vec<u8>)> {
        if e.is_deleted() {
            return Err(crate::Error::EntryDeleted);
        }
        let buf = self
            .fio
            .slice(e.msg_offset, e.msg_offset + e.message_size() as i64)?;
        let (topic, value) = buf.split_at(e.topic_size as usize);
        Ok((topic.to_vec(), value.to_vec()))
    }

    pub fn read_topic(&self, e: &IndexEntry) -> Result<Vec<u8>> {
        if e.is_deleted() {
            return Err(crate::Error::EntryDeleted);
        }
        self.fio
            .slice(e.msg_offset, e.msg_offset + e.topic_size as i64)
    }

    /// Releases an entry's slab back to the free list.
    pub fn free(&self, e: &IndexEntry) -> Result<()> {
        let mut lease = self.lease.lock()?;
        lease.free(e.msg_offset, e.message_size() as i64);
        Ok(())
    }

    fn allocate(&self, size: i64) -> Option<i64> {
        self.lease
            .lock()
            .map(|mut lease| lease.allocate(size))
            .unwrap_or(None)
    }

    pub fn free_count(&self) -> usize {
        self.lease.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Persists the free list to the lease file.
    pub fn save_lease(&self) -> Result<()> {
        let buf = {
            let lease = self.lease.lock()?;
            lease.encode()
        };
        self.lease_fio.truncate(0)?;
        self.lease_fio.write_at(&buf, 0)?;
        self.lease_fio.sync()
    }

    pub fn size(&self) -> i64 {
        self.fio.size()
    }

    pub fn sync(&self) -> Result<()> {
        self.fio.sync()
    }
}

/// Stages message slabs for one sync cycle. Freed ranges are reused with
/// direct positional writes; everything else accumulates into one buffer
/// appended at the end of the file.
pub struct DataWriter<'a> {
    data: &'a DataFile,
    buffer: Vec<u8>,
    append_base: i64,
    reused: Vec<(i64, Vec<u8>)>,
}

impl<'a> DataWriter<'a> {
    pub fn new(data: &'a DataFile, buffer: Vec<u8>) -> Self {
        Self {
            data,
            buffer,
            append_base: -1,
            reused: Vec::new(),
        }
    }

    /// Stages one `[topic][value]` slab and returns its message offset.
    pub fn write_message(&mut self, msg: &[u8]) -> Result<i64> {
        if let Some(off) = self.data.allocate(msg.len() as i64) {
            self.reused.push((off, msg.to_vec()));
            return Ok(off);
        }
        if self.append_base < 0 {
            self.append_base = self.data.fio.size();
        }
        let off = self.append_base + self.buffer.len() as i64;
        self.buffer.extend_from_slice(msg);
        Ok(off)
    }

    /// Flushes staged slabs and resets the writer for the next batch.
    pub fn write(&mut self) -> Result<()> {
        for (off, msg) in self.reused.drain(..) {
            self.data.fio.write_at(&msg, off)?;
        }
        if !self.buffer.is_empty() {
            self.data.fio.write_at(&self.buffer, self.append_base)?;
            self.buffer.clear();
        }
        self.append_base = -1;
        Ok(())
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_data(dir: &TempDir, min_free: u32) -> DataFile {
        let fio = Fio::open(dir.path().join("data")).unwrap();
        let lease = Fio::open(dir.path().join("lease")).unwrap();
        DataFile::open(fio, lease, min_free).unwrap()
    }

    fn record(seq: u64, off: i64, topic: &[u8], value: &[u8]) -> IndexEntry {
        IndexEntry {
            seq,
            msg_offset: off,
            topic_size: topic.len() as u16,
            value_size: value.len() as u32,
            ..Default::default()
        }
    }

    #[test]
    fn test_write_read_message() {
        let dir = TempDir::new().unwrap();
        let data = open_data(&dir, 16);
        let mut writer = DataWriter::new(&data, Vec::new());

        let off1 = writer.write_message(b"topic.avalue-1").unwrap();
        let off2 = writer.write_message(b"topic.bvalue-2").unwrap();
        writer.write().unwrap();

        let e1 = record(1, off1, b"topic.a", b"value-1");
        let e2 = record(2, off2, b"topic.b", b"value-2");
        assert_eq!(
            data.read_message(&e1).unwrap(),
            (b"topic.a".to_vec(), b"value-1".to_vec())
        );
        assert_eq!(data.read_topic(&e2).unwrap(), b"topic.b".to_vec());
    }

    #[test]
    fn test_free_ranges_are_reused() {
        let dir = TempDir::new().unwrap();
        let data = open_data(&dir, 8);

        let mut writer = DataWriter::new(&data, Vec::new());
        let off = writer.write_message(&[7u8; 64]).unwrap();
        writer.write().unwrap();
        let size_before = data.size();

        data.free(&record(1, off, &[0u8; 32], &[0u8; 32])).unwrap();
        assert_eq!(data.free_count(), 1);

        // Next same-size slab lands in the freed range: no growth.
        let mut writer = DataWriter::new(&data, Vec::new());
        let off2 = writer.write_message(&[9u8; 64]).unwrap();
        writer.write().unwrap();
        assert_eq!(off2, off);
        assert_eq!(data.size(), size_before);
        assert_eq!(data.free_count(), 0);
    }

    #[test]
    fn test_freelist_coalesces() {
        let mut list = FreeList::new(4);
        list.free(100, 10);
        list.free(120, 10);
        assert_eq!(list.len(), 2);
        // The gap filler merges all three into one range.
        list.free(110, 10);
        assert_eq!(list.len(), 1);
        assert_eq!(list.allocate(30), Some(100));
        assert!(list.is_empty());

        // Undersized ranges are not tracked.
        list.free(500, 2);
        assert!(list.is_empty());
    }

    #[test]
    fn test_freelist_persists() {
        let dir = TempDir::new().unwrap();
        {
            let data = open_data(&dir, 8);
            data.free(&record(1, 256, &[0u8; 16], &[0u8; 16])).unwrap();
            data.save_lease().unwrap();
        }
        let data = open_data(&dir, 8);
        assert_eq!(data.free_count(), 1);
        let mut writer = DataWriter::new(&data, Vec::new());
        assert_eq!(writer.write_message(&[1u8; 32]).unwrap(), 256);
    }

    #[test]
    fn test_deleted_entry_unreadable() {
        let dir = TempDir::new().unwrap();
        let data = open_data(&dir, 8);
        let e = IndexEntry {
            seq: 1,
            msg_offset: -1,
            ..Default::default()
        };
        assert_eq!(data.read_message(&e), Err(crate::Error::EntryDeleted));
    }
}
