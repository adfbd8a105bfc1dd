use std::collections::HashMap;
use std::sync::RwLock;

use byteorder::{ByteOrder, LittleEndian};

use crate::errdata;
use crate::error::Result;
use crate::hash::Consistent;
use crate::Error;

/// Shard count of the block cache. Must match the consistent ring size.
pub const N_SHARDS: u32 = 32;

/// Shrink runs when the total arena size crosses this share of the target.
const MEM_SHRINK_FACTOR: f64 = 0.7;

/// A shard only marks an offset reclaimable once it crosses this share of
/// the shard's arena, so shrinking frees a meaningful chunk at a time.
const DATA_TABLE_SHRINK_FACTOR: f64 = 0.33;

/// Append-only in-memory byte arena backing one shard.
#[derive(Debug, Default)]
struct DataTable {
    buf: Vec<u8>,
}

impl DataTable {
    fn allocate(&mut self, size: u32) -> i64 {
        let off = self.buf.len() as i64;
        self.buf.resize(self.buf.len() + size as usize, 0);
        off
    }

    fn write_at(&mut self, data: &[u8], off: i64) -> Result<()> {
        let off = off as usize;
        if off + data.len() > self.buf.len() {
            return errdata!("arena write past allocation: {} > {}", off + data.len(), self.buf.len());
        }
        self.buf[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_raw(&self, off: i64, len: u32) -> Result<&[u8]> {
        let (off, len) = (off as usize, len as usize);
        if off + len > self.buf.len() {
            return errdata!("arena read past end: {} > {}", off + len, self.buf.len());
        }
        Ok(&self.buf[off..off + len])
    }

    /// Drops everything below `off` and shifts the remainder down.
    fn shrink(&mut self, off: i64) {
        self.buf.drain(..off as usize);
    }

    fn size(&self) -> i64 {
        self.buf.len() as i64
    }
}

#[derive(Debug, Default)]
struct Shard {
    // key -> arena offset; -1 tombstones a deleted entry.
    map: HashMap<u64, i64>,
    data: DataTable,
    // Lowest offset eligible to be reclaimed by the next shrink.
    free_offset: i64,
}

/// Staging area for payloads between put and sync: a shard-striped map of
/// `cache_id XOR seq` keys to length-prefixed records in per-shard arenas.
#[derive(Debug)]
pub struct MemDb {
    target_size: i64,
    ring: Consistent,
    shards: Vec<RwLock<Shard>>,
}

impl MemDb {
    /// Creates a store that aims to stay under `target_size` bytes.
    pub fn open(target_size: i64) -> Self {
        Self {
            target_size,
            ring: Consistent::new(N_SHARDS),
            shards: (0..N_SHARDS).map(|_| RwLock::new(Shard::default())).collect(),
        }
    }

    fn shard(&self, block_id: u64) -> &RwLock<Shard> {
        &self.shards[self.ring.find_block(block_id)]
    }

    /// Stores data under the key, prefixed with its length.
    pub fn set(&self, block_id: u64, key: u64, data: &[u8]) -> Result<()> {
        let mut shard = self.shard(block_id).write()?;
        let size = data.len() as u32 + 4;
        let off = shard.data.allocate(size);
        let mut scratch = [0u8; 4];
        LittleEndian::write_u32(&mut scratch, size);
        shard.data.write_at(&scratch, off)?;
        shard.data.write_at(data, off + 4)?;
        shard.map.insert(key, off);
        Ok(())
    }

    /// Fetches the data stored under the key, or `None` when the key is
    /// unknown (typically: already synced and reclaimed). A tombstoned key
    /// returns `Error::EntryDeleted`.
    pub fn get(&self, block_id: u64, key: u64) -> Result<Option<Vec<u8>>> {
        let shard = self.shard(block_id).read()?;
        let off = match shard.map.get(&key) {
            Some(&-1) => return Err(Error::EntryDeleted),
            Some(&off) => off,
            None => return Ok(None),
        };
        let scratch = shard.data.read_raw(off, 4)?;
        let size = LittleEndian::read_u32(scratch);
        let data = shard.data.read_raw(off, size)?;
        Ok(Some(data[4..].to_vec()))
    }

    /// Tombstones the key. Later gets return `Error::EntryDeleted`.
    pub fn remove(&self, block_id: u64, key: u64) -> Result<()> {
        let mut shard = self.shard(block_id).write()?;
        if let Some(off) = shard.map.get_mut(&key) {
            *off = -1;
        }
        Ok(())
    }

    /// Marks the key's allocation as reclaimable. The shard records at most
    /// one pending free offset, and only once it crosses a third of the
    /// arena, so shrink cycles reclaim in large steps.
    pub fn free(&self, block_id: u64, key: u64) -> Result<()> {
        let mut shard = self.shard(block_id).write()?;
        if shard.free_offset > 0 {
            return Ok(());
        }
        if let Some(&off) = shard.map.get(&key) {
            if off > shard.free_offset
                && off as f64 > shard.data.size() as f64 * DATA_TABLE_SHRINK_FACTOR
            {
                shard.free_offset = off;
            }
        }
        Ok(())
    }

    /// Snapshot of the keys in the shard owning `block_id`.
    pub fn keys(&self, block_id: u64) -> Vec<u64> {
        let shard = self.shard(block_id).read().unwrap_or_else(|e| e.into_inner());
        shard.map.keys().copied().collect()
    }

    pub fn count(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.read().map(|s| s.map.len()).unwrap_or(0) as u64)
            .sum()
    }

    pub fn size(&self) -> i64 {
        self.shards
            .iter()
            .map(|s| s.read().map(|s| s.data.size()).unwrap_or(0))
            .sum()
    }

    /// Runs a shrink cycle when the store has outgrown its target. Called
    /// periodically by the drain worker; safe to call at any time.
    pub fn maybe_shrink(&self) -> Result<()> {
        if (self.size() as f64) <= self.target_size as f64 * MEM_SHRINK_FACTOR {
            return Ok(());
        }
        self.shrink_data_table()
    }

    /// Truncates each shard's arena up to its free offset, rebasing the
    /// surviving offsets and dropping keys below the cut.
    pub fn shrink_data_table(&self) -> Result<()> {
        for shard in &self.shards {
            let mut shard = shard.write()?;
            let cut = shard.free_offset;
            if cut <= 0 {
                continue;
            }
            shard.data.shrink(cut);
            shard.map.retain(|_, off| {
                if *off == -1 {
                    // Tombstones below the cut are gone with the data.
                    return true;
                }
                if *off < cut {
                    return false;
                }
                *off -= cut;
                true
            });
            shard.free_offset = 0;
        }
        Ok(())
    }
}
