use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_skiplist::SkipMap;

use crate::clock;
use crate::errdata;
use crate::error::Result;
use crate::fio::Fio;
use crate::hash::Consistent;
use crate::memdb::N_SHARDS;

/// On-disk size of a window block.
pub const BLOCK_SIZE: usize = 4096;

/// Encoded size of one window entry.
pub const WIN_ENTRY_SIZE: usize = 12;

// cutoff i64 + topic hash u64 + next i64 + entry index u16
const WIN_TAIL_SIZE: usize = 26;

/// Entries per window block; the remainder of the block is zero padding.
pub const SEQS_PER_WINDOW_BLOCK: usize = (BLOCK_SIZE - WIN_TAIL_SIZE) / WIN_ENTRY_SIZE;

const WINDOW_SIGNATURE: [u8; 8] = *b"unitdbwn";
const WINDOW_VERSION: u32 = 1;

/// One write sequence buffered for a topic, with its expiry stamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WinEntry {
    pub seq: u64,
    pub expires_at: u32,
}

impl WinEntry {
    pub fn is_expired(&self) -> bool {
        self.expires_at != 0 && self.expires_at <= clock::unix32()
    }
}

/// Fixed-size on-disk block of window entries for a single topic hash.
/// `next` holds the file offset of the previous (older) block for the same
/// hash; 0 terminates the chain. The newest block's offset lives in the
/// trie, so iteration runs in reverse insertion time.
#[derive(Clone, Debug)]
pub struct WinBlock {
    pub topic_hash: u64,
    pub entries: [WinEntry; SEQS_PER_WINDOW_BLOCK],
    pub next: i64,
    pub cutoff: i64,
    pub entry_idx: u16,

    // In-memory write state, not persisted.
    pub(crate) dirty: bool,
    pub(crate) leased: bool,
}

impl Default for WinBlock {
    fn default() -> Self {
        Self {
            topic_hash: 0,
            entries: [WinEntry::default(); SEQS_PER_WINDOW_BLOCK],
            next: 0,
            cutoff: 0,
            entry_idx: 0,
            dirty: false,
            leased: false,
        }
    }
}

impl WinBlock {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut off = 0;
        for e in &self.entries {
            LittleEndian::write_u64(&mut buf[off..off + 8], e.seq);
            LittleEndian::write_u32(&mut buf[off + 8..off + 12], e.expires_at);
            off += WIN_ENTRY_SIZE;
        }
        LittleEndian::write_i64(&mut buf[off..off + 8], self.cutoff);
        LittleEndian::write_u64(&mut buf[off + 8..off + 16], self.topic_hash);
        LittleEndian::write_i64(&mut buf[off + 16..off + 24], self.next);
        LittleEndian::write_u16(&mut buf[off + 24..off + 26], self.entry_idx);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_SIZE {
            return errdata!("window block too short: {} bytes", buf.len());
        }
        let mut block = WinBlock::default();
        let mut off = 0;
        for e in block.entries.iter_mut() {
            e.seq = LittleEndian::read_u64(&buf[off..off + 8]);
            e.expires_at = LittleEndian::read_u32(&buf[off + 8..off + 12]);
            off += WIN_ENTRY_SIZE;
        }
        block.cutoff = LittleEndian::read_i64(&buf[off..off + 8]);
        block.topic_hash = LittleEndian::read_u64(&buf[off + 8..off + 16]);
        block.next = LittleEndian::read_i64(&buf[off + 16..off + 24]);
        block.entry_idx = LittleEndian::read_u16(&buf[off + 24..off + 26]);
        Ok(block)
    }

    /// True once the block was sealed before the given cutoff, meaning no
    /// older block can satisfy a `last=` bound either.
    pub fn cutoff_before(&self, cutoff: i64) -> bool {
        self.cutoff != 0 && self.cutoff < cutoff
    }

    fn contains_seq(&self, seq: u64) -> bool {
        self.entries[..self.entry_idx as usize]
            .iter()
            .any(|e| e.seq == seq)
    }

    fn validate(&self, topic_hash: u64) -> Result<()> {
        if self.topic_hash != 0 && self.topic_hash != topic_hash {
            return errdata!(
                "window block topic hash {} does not match {}",
                self.topic_hash,
                topic_hash
            );
        }
        Ok(())
    }
}

/// File offset of the window block with the given index. Page 0 of the
/// window file holds the header, so block 0 starts one page in and offset 0
/// can serve as the chain terminator.
pub fn win_block_offset(idx: i32) -> i64 {
    BLOCK_SIZE as i64 * (idx as i64 + 1)
}

fn offset_to_idx(off: i64) -> i32 {
    (off / BLOCK_SIZE as i64 - 1) as i32
}

#[derive(Debug, Default)]
struct TimeWindow {
    frozen: bool,
    entries: HashMap<u64, Vec<WinEntry>>,
    // Arrivals appended while the shard is frozen for a sync.
    frozen_entries: HashMap<u64, Vec<WinEntry>>,
}

impl TimeWindow {
    fn unfreeze(&mut self) {
        self.frozen = false;
        for (hash, entries) in self.frozen_entries.drain() {
            self.entries.entry(hash).or_default().extend(entries);
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimeOptions {
    pub exp_duration: Duration,
    pub max_exp_durations: usize,
    pub background_key_expiry: bool,
}

impl Default for TimeOptions {
    fn default() -> Self {
        Self {
            exp_duration: Duration::from_secs(60),
            max_exp_durations: 1,
            background_key_expiry: false,
        }
    }
}

/// Shard-striped buffer of recent write sequences per topic hash, persisted
/// as reverse-linked window blocks in the window file.
#[derive(Debug)]
pub struct TimeWindowBucket {
    file: Fio,
    shards: Vec<RwLock<TimeWindow>>,
    ring: Consistent,
    // Highest allocated block index; -1 when the file holds no blocks.
    window_idx: AtomicI32,
    expiry: ExpiryWindowBucket,
    opts: TimeOptions,
}

impl TimeWindowBucket {
    pub fn open(file: Fio, opts: TimeOptions) -> Result<Self> {
        let window_idx = if file.size() == 0 {
            let mut page = vec![0u8; BLOCK_SIZE];
            page[..8].copy_from_slice(&WINDOW_SIGNATURE);
            LittleEndian::write_u32(&mut page[8..12], WINDOW_VERSION);
            file.write_at(&page, 0)?;
            -1
        } else {
            let header = file.slice(0, 12)?;
            if header[..8] != WINDOW_SIGNATURE {
                return errdata!("bad window file signature");
            }
            (file.size() / BLOCK_SIZE as i64 - 2) as i32
        };

        let expiry = ExpiryWindowBucket::new(&opts);
        Ok(Self {
            file,
            shards: (0..N_SHARDS).map(|_| RwLock::new(TimeWindow::default())).collect(),
            ring: Consistent::new(N_SHARDS),
            window_idx: AtomicI32::new(window_idx),
            expiry,
            opts,
        })
    }

    pub fn options(&self) -> &TimeOptions {
        &self.opts
    }

    fn shard(&self, topic_hash: u64) -> &RwLock<TimeWindow> {
        &self.shards[self.ring.find_block(topic_hash)]
    }

    /// Buffers a write sequence for the topic. Never blocks on a sync in
    /// progress: frozen shards divert arrivals into a side map.
    pub fn add(&self, topic_hash: u64, entry: WinEntry) -> Result<()> {
        let mut shard = self.shard(topic_hash).write()?;
        if shard.frozen {
            shard.frozen_entries.entry(topic_hash).or_default().push(entry);
        } else {
            shard.entries.entry(topic_hash).or_default().push(entry);
        }
        Ok(())
    }

    /// Iterates shard snapshots. With `freeze` set, each shard is frozen
    /// while `f` observes its snapshot: writers divert to the side map, and
    /// the shard is reset only when `f` succeeds. `f` returns `true` to
    /// stop early; errors skip the reset but still unfreeze.
    pub fn foreach_time_window<F>(&self, freeze: bool, mut f: F) -> Result<()>
    where
        F: FnMut(&HashMap<u64, Vec<WinEntry>>) -> Result<bool>,
    {
        let mut last_err = Ok(());
        for shard in &self.shards {
            let snapshot = {
                let mut w = shard.write()?;
                if freeze {
                    w.frozen = true;
                }
                w.entries.clone()
            };

            let outcome = f(&snapshot);
            if freeze {
                let mut w = shard.write()?;
                if matches!(&outcome, Ok(false)) {
                    w.entries.clear();
                }
                w.unfreeze();
            }
            match outcome {
                Ok(false) => {}
                Ok(true) => continue,
                Err(err) => last_err = Err(err),
            }
        }
        last_err
    }

    /// Iterates every window block on disk, oldest first. Used on open to
    /// warm the trie with each topic's newest block offset.
    pub fn foreach_window_block<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&WinBlock, i64) -> Result<bool>,
    {
        let top = self.window_index();
        for idx in 0..=top {
            let off = win_block_offset(idx);
            let block = self.read_block(off)?;
            if f(&block, off)? {
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn read_block(&self, off: i64) -> Result<WinBlock> {
        let buf = self.file.slice(off, off + BLOCK_SIZE as i64)?;
        WinBlock::decode(&buf)
    }

    /// Returns up to `limit` not-yet-synced entries for the topic, newest
    /// first. Expired entries are diverted to the expiry bucket best-effort
    /// and never abort the lookup.
    pub fn ilookup(&self, topic_hash: u64, limit: usize) -> Vec<WinEntry> {
        let mut out = Vec::new();
        let shard = match self.shard(topic_hash).read() {
            Ok(shard) => shard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Entries arriving during a freeze are the newest.
        for source in [&shard.frozen_entries, &shard.entries] {
            let Some(entries) = source.get(&topic_hash) else {
                continue;
            };
            for we in entries.iter().rev() {
                if out.len() >= limit {
                    return out;
                }
                if we.is_expired() {
                    self.add_expiry(*we);
                    continue;
                }
                out.push(*we);
            }
        }
        out
    }

    /// Returns up to `limit` entries for the topic in reverse time order,
    /// continuing from memory into the on-disk chain rooted at `off`.
    /// Stops at a sealed block older than `cutoff`, at the chain end, or on
    /// a topic hash mismatch (corruption guard).
    pub fn lookup(&self, topic_hash: u64, off: i64, cutoff: i64, limit: usize) -> Vec<WinEntry> {
        let mut out = self.ilookup(topic_hash, limit);
        if out.len() >= limit || off == 0 {
            return out;
        }

        let mut off = off;
        loop {
            let block = match self.read_block(off) {
                Ok(block) => block,
                Err(err) => {
                    tracing::error!(error = %err, offset = off, "window chain read failed");
                    break;
                }
            };
            if block.topic_hash != topic_hash {
                tracing::error!(
                    offset = off,
                    expected = topic_hash,
                    found = block.topic_hash,
                    "window chain topic hash mismatch"
                );
                break;
            }
            for i in (0..block.entry_idx as usize).rev() {
                let we = block.entries[i];
                if we.seq == 0 {
                    continue;
                }
                if we.is_expired() {
                    self.add_expiry(we);
                    continue;
                }
                out.push(we);
                if out.len() >= limit {
                    return out;
                }
            }
            if block.cutoff_before(cutoff) || block.next == 0 {
                break;
            }
            off = block.next;
        }
        out
    }

    // Best effort: a full or failed expiry index must not disturb reads.
    fn add_expiry(&self, we: WinEntry) {
        if let Err(err) = self.expiry.add_expiry(we) {
            tracing::error!(error = %err, seq = we.seq, "expiry index insert failed");
        }
    }

    /// Drains up to `max` entries whose expiry windows are due.
    pub fn expire_old_entries(&self, max: usize) -> Vec<WinEntry> {
        self.expiry.expire_old_entries(max)
    }

    pub fn expiry_errors(&self) -> u64 {
        self.expiry.error_count()
    }

    pub fn window_index(&self) -> i32 {
        self.window_idx.load(Ordering::Acquire)
    }

    fn next_window_index(&self) -> i32 {
        self.window_idx.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Removes buffered (not yet synced) entries with the given seq for the
    /// topic, returning how many were dropped.
    pub fn remove(&self, topic_hash: u64, seq: u64) -> Result<usize> {
        let mut shard = self.shard(topic_hash).write()?;
        let mut removed = 0;
        if let Some(entries) = shard.entries.get_mut(&topic_hash) {
            let before = entries.len();
            entries.retain(|we| we.seq != seq);
            removed += before - entries.len();
        }
        if let Some(entries) = shard.frozen_entries.get_mut(&topic_hash) {
            let before = entries.len();
            entries.retain(|we| we.seq != seq);
            removed += before - entries.len();
        }
        Ok(removed)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}

/// Stages window blocks for one sync cycle and writes them with grouped
/// positional writes. Blocks loaded back from disk are leased: their rows
/// are tracked so a failed cycle can roll them back.
pub struct WindowWriter<'a> {
    bucket: &'a TimeWindowBucket,
    blocks: HashMap<i32, WinBlock>,
    leasing: HashMap<i32, Vec<u64>>,
    buffer: Vec<u8>,
}

impl<'a> WindowWriter<'a> {
    pub fn new(bucket: &'a TimeWindowBucket, buffer: Vec<u8>) -> Self {
        Self {
            bucket,
            blocks: HashMap::new(),
            leasing: HashMap::new(),
            buffer,
        }
    }

    /// Appends entries for the topic whose current newest block sits at
    /// `off` (0 when none), reusing that block while it has room and
    /// chaining fresh blocks as it fills. Duplicate seqs already present in
    /// a block are dropped silently. Returns the new newest-block offset.
    pub fn append(&mut self, topic_hash: u64, off: i64, entries: &[WinEntry]) -> Result<i64> {
        let mut idx = if off == 0 {
            self.bucket.next_window_index()
        } else {
            offset_to_idx(off)
        };

        let mut block = match self.blocks.remove(&idx) {
            Some(block) => block,
            None if off != 0 && idx <= self.bucket.window_index() => {
                let mut block = self.bucket.read_block(off)?;
                block.validate(topic_hash)?;
                block.leased = true;
                block
            }
            None => WinBlock::default(),
        };
        block.topic_hash = topic_hash;

        for we in entries {
            if we.seq == 0 || block.contains_seq(we.seq) {
                continue;
            }
            if block.entry_idx as usize == SEQS_PER_WINDOW_BLOCK {
                let prev = win_block_offset(idx);
                block.cutoff = clock::unix();
                self.blocks.insert(idx, block);

                idx = self.bucket.next_window_index();
                block = WinBlock {
                    topic_hash,
                    next: prev,
                    ..WinBlock::default()
                };
            }
            if block.leased {
                self.leasing.entry(idx).or_default().push(we.seq);
            }
            block.entries[block.entry_idx as usize] = *we;
            block.entry_idx += 1;
            block.dirty = true;
        }

        self.blocks.insert(idx, block);
        Ok(win_block_offset(idx))
    }

    /// Flushes dirty blocks. Leased blocks are rewritten in place one at a
    /// time; fresh blocks are grouped into consecutive runs so each run
    /// costs one positional write.
    pub fn write(&mut self) -> Result<()> {
        for (&idx, block) in self.blocks.iter_mut() {
            if block.leased && block.dirty {
                self.bucket.file.write_at(&block.encode(), win_block_offset(idx))?;
                block.dirty = false;
            }
        }

        let mut idxs: Vec<i32> = self
            .blocks
            .iter()
            .filter(|(_, b)| !b.leased && b.dirty)
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
                let block = self.blocks.get_mut(&idx).expect("staged block");
                self.buffer.extend_from_slice(&block.encode());
                block.dirty = false;
            }
            self.bucket
                .file
                .write_at(&self.buffer, win_block_offset(idxs[start]))?;
            i += 1;
        }
        Ok(())
    }

    /// Removes every leased row staged by this writer from its on-disk
    /// block, durably. Used when a sync cycle fails after loading blocks.
    pub fn rollback(&mut self) -> Result<()> {
        let leasing = std::mem::take(&mut self.leasing);
        for (idx, seqs) in leasing {
            for seq in seqs {
                self.del(seq, idx)?;
            }
        }
        Ok(())
    }

    fn del(&mut self, seq: u64, idx: i32) -> Result<()> {
        let off = win_block_offset(idx);
        let mut block = match self.blocks.remove(&idx) {
            Some(block) => block,
            None => self.bucket.read_block(off)?,
        };
        let len = block.entry_idx as usize;
        let Some(pos) = block.entries[..len].iter().position(|e| e.seq == seq) else {
            self.blocks.insert(idx, block);
            return Ok(());
        };
        block.entries.copy_within(pos + 1..len, pos);
        block.entries[len - 1] = WinEntry::default();
        block.entry_idx -= 1;

        self.bucket.file.write_at(&block.encode(), off)?;
        block.dirty = false;
        self.blocks.insert(idx, block);
        Ok(())
    }

    /// Hands the scratch buffer back for pooling.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// Concurrent index of soon-to-expire entries keyed by their expiry time
/// rounded up to the expiry window. Inserts come from read paths, so the
/// index is lock-free at the map level.
pub struct ExpiryWindowBucket {
    window_secs: i64,
    buckets: SkipMap<i64, Mutex<Vec<WinEntry>>>,
    errors: AtomicU64,
}

impl std::fmt::Debug for ExpiryWindowBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryWindowBucket")
            .field("window_secs", &self.window_secs)
            .field("windows", &self.buckets.len())
            .finish()
    }
}

impl ExpiryWindowBucket {
    fn new(opts: &TimeOptions) -> Self {
        let window = opts.exp_duration.as_secs().max(1) * opts.max_exp_durations.max(1) as u64;
        Self {
            window_secs: window as i64,
            buckets: SkipMap::new(),
            errors: AtomicU64::new(0),
        }
    }

    pub fn add_expiry(&self, we: WinEntry) -> Result<()> {
        if we.expires_at == 0 {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return errdata!("entry without expiry added to expiry index");
        }
        let at = we.expires_at as i64;
        let key = (at + self.window_secs - 1) / self.window_secs * self.window_secs;
        let bucket = self.buckets.get_or_insert_with(key, || Mutex::new(Vec::new()));
        let mut entries = bucket.value().lock()?;
        if !entries.iter().any(|e| e.seq == we.seq) {
            entries.push(we);
        }
        Ok(())
    }

    /// Drains up to `max` due entries in expiry order.
    pub fn expire_old_entries(&self, max: usize) -> Vec<WinEntry> {
        let due = clock::unix() + self.window_secs;
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            if *bucket.key() > due || out.len() >= max {
                break;
            }
            let mut entries = match bucket.value().lock() {
                Ok(entries) => entries,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Rounded windows mix stamps, so filter on the actual expiry.
            entries.retain(|we| {
                if out.len() < max && we.is_expired() {
                    out.push(*we);
                    false
                } else {
                    true
                }
            });
            if entries.is_empty() {
                drop(entries);
                bucket.remove();
            }
        }
        out
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
