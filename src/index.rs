use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::entry::{IndexEntry, ENTRY_SIZE};
use crate::errdata;
use crate::error::Result;
use crate::fio::Fio;

/// Entries per index bucket; the remainder of the bucket holds the overflow
/// link and padding.
pub const ENTRIES_PER_BUCKET: usize = 127;

/// On-disk size of an index bucket.
pub const BUCKET_SIZE: usize = 4096;

const NEXT_OFFSET: usize = ENTRIES_PER_BUCKET * ENTRY_SIZE;

pub fn bucket_offset(idx: u32) -> i64 {
    BUCKET_SIZE as i64 * idx as i64
}

/// Home bucket of a sequence. Sequences are dense, so consecutive runs of
/// `ENTRIES_PER_BUCKET` seqs share a bucket and overflow links stay rare.
pub fn start_bucket_index(seq: u64) -> u32 {
    ((seq - 1) / ENTRIES_PER_BUCKET as u64) as u32
}

/// Fixed-size bucket of entry records. `next` links an overflow bucket, 0
/// when none.
#[derive(Clone, Debug)]
pub struct Bucket {
    pub entries: [IndexEntry; ENTRIES_PER_BUCKET],
    pub next: i64,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            entries: [IndexEntry::default(); ENTRIES_PER_BUCKET],
            next: 0,
        }
    }
}

impl Bucket {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BUCKET_SIZE];
        let mut off = 0;
        for e in &self.entries {
            buf[off..off + ENTRY_SIZE].copy_from_slice(&e.encode());
            off += ENTRY_SIZE;
        }
        LittleEndian::write_i64(&mut buf[NEXT_OFFSET..NEXT_OFFSET + 8], self.next);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BUCKET_SIZE {
            return errdata!("index bucket too short: {} bytes", buf.len());
        }
        let mut bucket = Bucket::default();
        let mut off = 0;
        for e in bucket.entries.iter_mut() {
            *e = IndexEntry::decode(&buf[off..off + ENTRY_SIZE])?;
            off += ENTRY_SIZE;
        }
        bucket.next = LittleEndian::read_i64(&buf[NEXT_OFFSET..NEXT_OFFSET + 8]);
        Ok(bucket)
    }

    /// Number of occupied slots. Entries are appended in order and
    /// tombstones keep their seq, so the first zero seq ends the bucket.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .position(|e| e.seq == 0)
            .unwrap_or(ENTRIES_PER_BUCKET)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, seq: u64) -> Option<usize> {
        self.entries[..self.len()].iter().position(|e| e.seq == seq)
    }
}

pub fn read_bucket(file: &Fio, idx: u32) -> Result<Bucket> {
    let off = bucket_offset(idx);
    Bucket::decode(&file.slice(off, off + BUCKET_SIZE as i64)?)
}

/// Looks up the entry record for a sequence, following overflow links.
pub fn read_entry(file: &Fio, n_buckets: u32, seq: u64) -> Result<Option<IndexEntry>> {
    if seq == 0 {
        return Ok(None);
    }
    let mut idx = start_bucket_index(seq);
    loop {
        if idx >= n_buckets {
            return Ok(None);
        }
        let bucket = read_bucket(file, idx)?;
        if let Some(pos) = bucket.find(seq) {
            return Ok(Some(bucket.entries[pos]));
        }
        if bucket.next == 0 {
            return Ok(None);
        }
        idx = (bucket.next / BUCKET_SIZE as i64) as u32;
    }
}

/// Tombstones the entry for a sequence in place, returning the record it
/// held. Already-deleted and unknown sequences return `None`.
pub fn tombstone(file: &Fio, n_buckets: u32, seq: u64) -> Result<Option<IndexEntry>> {
    if seq == 0 {
        return Ok(None);
    }
    let mut idx = start_bucket_index(seq);
    loop {
        if idx >= n_buckets {
            return Ok(None);
        }
        let mut bucket = read_bucket(file, idx)?;
        if let Some(pos) = bucket.find(seq) {
            let old = bucket.entries[pos];
            if old.is_deleted() {
                return Ok(None);
            }
            bucket.entries[pos].msg_offset = -1;
            file.write_at(&bucket.encode(), bucket_offset(idx))?;
            return Ok(Some(old));
        }
        if bucket.next == 0 {
            return Ok(None);
        }
        idx = (bucket.next / BUCKET_SIZE as i64) as u32;
    }
}

struct Slot {
    bucket: Bucket,
    dirty: bool,
    leased: bool,
}

/// Stages index buckets for one sync cycle. Buckets already on disk are
/// leased (read back and patched); fresh buckets are written in grouped
/// consecutive runs.
pub struct BlockWriter<'a> {
    file: &'a Fio,
    n_buckets: u32,
    buckets: HashMap<u32, Slot>,
    buffer: Vec<u8>,
}

impl<'a> BlockWriter<'a> {
    pub fn new(file: &'a Fio, n_buckets: u32, buffer: Vec<u8>) -> Self {
        Self {
            file,
            n_buckets,
            buckets: HashMap::new(),
            buffer,
        }
    }

    /// One past the highest bucket index in use, staged buckets included.
    fn top(&self) -> u32 {
        self.buckets
            .iter()
            .filter(|(_, s)| !s.leased)
            .map(|(&idx, _)| idx + 1)
            .max()
            .unwrap_or(0)
            .max(self.n_buckets)
    }

    fn load(&mut self, idx: u32) -> Result<()> {
        if self.buckets.contains_key(&idx) {
            return Ok(());
        }
        let slot = if idx < self.n_buckets {
            Slot {
                bucket: read_bucket(self.file, idx)?,
                dirty: false,
                leased: true,
            }
        } else {
            Slot {
                bucket: Bucket::default(),
                dirty: false,
                leased: false,
            }
        };
        self.buckets.insert(idx, slot);
        Ok(())
    }

    /// Appends an entry record to its home bucket, spilling into linked
    /// overflow buckets when full. Returns `true` when the seq was already
    /// present (the caller skips filter and counter updates).
    pub fn append(&mut self, e: IndexEntry) -> Result<bool> {
        if e.seq == 0 {
            return errdata!("entry record without a sequence");
        }
        let mut idx = start_bucket_index(e.seq);
        loop {
            self.load(idx)?;
            let next_alloc = self.top();
            let slot = self.buckets.get_mut(&idx).expect("loaded bucket");
            if slot.bucket.find(e.seq).is_some() {
                return Ok(true);
            }
            let len = slot.bucket.len();
            if len < ENTRIES_PER_BUCKET {
                slot.bucket.entries[len] = e;
                slot.dirty = true;
                return Ok(false);
            }
            if slot.bucket.next != 0 {
                idx = (slot.bucket.next / BUCKET_SIZE as i64) as u32;
                continue;
            }
            // Full home bucket: allocate and link an overflow bucket.
            slot.bucket.next = bucket_offset(next_alloc);
            slot.dirty = true;
            idx = next_alloc;
        }
    }

    /// Buckets the file must grow by to cover everything staged.
    pub fn count(&self) -> u32 {
        self.top() - self.n_buckets
    }

    /// Flushes dirty buckets: leased ones individually, fresh ones grouped
    /// into consecutive runs.
    pub fn write(&mut self) -> Result<()> {
        for (&idx, slot) in self.buckets.iter_mut() {
            if slot.leased && slot.dirty {
                self.file.write_at(&slot.bucket.encode(), bucket_offset(idx))?;
                slot.dirty = false;
            }
        }

        let mut idxs: Vec<u32> = self
            .buckets
            .iter()
            .filter(|(_, s)| !s.leased && s.dirty)
            .map(|(&idx, _)| idx)
            .collect();
        idxs.sort_unstable();

        let mut i = 0;
        while i < idxs.len() {
            let start = i;
            while i + 1 < idxs.len() && idxs[i + 1] == idxs[i] + 1 {
                i += 1;
            }
            self.buffer.clear();
            for &idx in &idxs[start..=i] {
                let slot = self.buckets.get_mut(&idx).expect("staged bucket");
                self.buffer.extend_from_slice(&slot.bucket.encode());
                slot.dirty = false;
            }
            self.file.write_at(&self.buffer, bucket_offset(idxs[start]))?;
            i += 1;
        }
        Ok(())
    }

    /// Absorbs the freshly-written buckets into the on-disk count and
    /// returns how many were added.
    pub fn flushed(&mut self) -> u32 {
        let added = self.top() - self.n_buckets;
        self.n_buckets += added;
        for slot in self.buckets.values_mut() {
            if !slot.leased && !slot.dirty {
                slot.leased = true;
            }
        }
        added
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn entry(seq: u64) -> IndexEntry {
        IndexEntry {
            seq,
            msg_offset: seq as i64 * 64,
            topic_size: 4,
            value_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_bucket_roundtrip() {
        let mut bucket = Bucket::default();
        bucket.entries[0] = entry(1);
        bucket.entries[1] = entry(2);
        bucket.next = bucket_offset(9);

        let buf = bucket.encode();
        assert_eq!(buf.len(), BUCKET_SIZE);
        let decoded = Bucket::decode(&buf).unwrap();
        assert_eq!(decoded.entries[..2], bucket.entries[..2]);
        assert_eq!(decoded.next, bucket.next);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.find(2), Some(1));
        assert_eq!(decoded.find(3), None);
    }

    #[test]
    fn test_append_write_read() {
        let dir = TempDir::new().unwrap();
        let file = Fio::open(dir.path().join("index")).unwrap();
        let mut writer = BlockWriter::new(&file, 0, Vec::new());

        for seq in 1..=300u64 {
            assert!(!writer.append(entry(seq)).unwrap());
        }
        writer.write().unwrap();
        let n_buckets = writer.flushed();
        assert_eq!(n_buckets, 3);

        for seq in [1u64, 127, 128, 255, 300] {
            let e = read_entry(&file, n_buckets, seq).unwrap().unwrap();
            assert_eq!(e.seq, seq);
            assert_eq!(e.msg_offset, seq as i64 * 64);
        }
        assert_eq!(read_entry(&file, n_buckets, 301).unwrap(), None);
    }

    #[test]
    fn test_duplicate_seq_reports_exists() {
        let dir = TempDir::new().unwrap();
        let file = Fio::open(dir.path().join("index")).unwrap();
        let mut writer = BlockWriter::new(&file, 0, Vec::new());

        assert!(!writer.append(entry(1)).unwrap());
        assert!(writer.append(entry(1)).unwrap());
        writer.write().unwrap();
        let n = writer.flushed();
        drop(writer);

        // A fresh writer sees the bucket on disk and still detects it.
        let mut writer = BlockWriter::new(&file, n, Vec::new());
        assert!(writer.append(entry(1)).unwrap());
    }

    #[test]
    fn test_tombstone() {
        let dir = TempDir::new().unwrap();
        let file = Fio::open(dir.path().join("index")).unwrap();
        let mut writer = BlockWriter::new(&file, 0, Vec::new());
        writer.append(entry(5)).unwrap();
        writer.write().unwrap();
        let n = writer.flushed();

        let old = tombstone(&file, n, 5).unwrap().unwrap();
        assert_eq!(old.seq, 5);
        assert!(read_entry(&file, n, 5).unwrap().unwrap().is_deleted());
        // Second tombstone is a no-op.
        assert_eq!(tombstone(&file, n, 5).unwrap(), None);
        assert_eq!(tombstone(&file, n, 6).unwrap(), None);
    }
}
