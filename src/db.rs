use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::bufpool::BufferPool;
use crate::cipher::{Cipher, Passthrough};
use crate::data::DataFile;
use crate::dbsync;
use crate::entry::{self, Entry, IndexEntry, ENTRY_SIZE};
use crate::errdata;
use crate::error::Result;
use crate::filter::Filter;
use crate::fio::Fio;
use crate::flock::FileLock;
use crate::index;
use crate::memdb::MemDb;
use crate::meter::{Meter, Varz};
use crate::options::Options;
use crate::scheduler::Scheduler;
use crate::tasks::{DrainTask, ExpiryTask, SyncTask};
use crate::timewindow::{TimeOptions, TimeWindowBucket, WinEntry};
use crate::topic::{Topic, DEFAULT_CONTRACT};
use crate::trie::Trie;
use crate::wal::{Wal, WalOptions};
use crate::Error;

const MAIN_SIGNATURE: [u8; 8] = *b"unitdb\x00\xfd";
const MAIN_VERSION: u32 = 1;
pub(crate) const MAIN_HEADER_SIZE: usize = 70;

/// Results returned when neither the query nor its topic set a limit.
const DEFAULT_QUERY_LIMIT: usize = 1000;

/// Entries drained per expiry cycle.
pub(crate) const MAX_EXPIRY_RESULTS: usize = 1024;

/// Header of the main file: the durable roots of the database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DbHeader {
    pub signature: [u8; 8],
    pub version: u32,
    pub seq: u64,
    pub count: u64,
    pub n_buckets: u32,
    pub window_idx: i32,
}

impl Default for DbHeader {
    fn default() -> Self {
        Self {
            signature: MAIN_SIGNATURE,
            version: MAIN_VERSION,
            seq: 0,
            count: 0,
            n_buckets: 0,
            window_idx: -1,
        }
    }
}

impl DbHeader {
    pub fn encode(&self) -> [u8; MAIN_HEADER_SIZE] {
        let mut buf = [0u8; MAIN_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.signature);
        LittleEndian::write_u32(&mut buf[8..12], self.version);
        LittleEndian::write_u64(&mut buf[12..20], self.seq);
        LittleEndian::write_u64(&mut buf[20..28], self.count);
        LittleEndian::write_u32(&mut buf[28..32], self.n_buckets);
        LittleEndian::write_i32(&mut buf[32..36], self.window_idx);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MAIN_HEADER_SIZE {
            return errdata!("main header too short: {} bytes", buf.len());
        }
        let mut header = DbHeader {
            signature: [0u8; 8],
            version: LittleEndian::read_u32(&buf[8..12]),
            seq: LittleEndian::read_u64(&buf[12..20]),
            count: LittleEndian::read_u64(&buf[20..28]),
            n_buckets: LittleEndian::read_u32(&buf[28..32]),
            window_idx: LittleEndian::read_i32(&buf[32..36]),
        };
        header.signature.copy_from_slice(&buf[0..8]);
        if header.signature != MAIN_SIGNATURE {
            return errdata!("bad database signature");
        }
        if header.version != MAIN_VERSION {
            return errdata!("unsupported database version {}", header.version);
        }
        Ok(header)
    }
}

/// A topic query with its optional contract and result limit.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub topic: Vec<u8>,
    pub contract: u32,
    pub limit: usize,
}

impl Query {
    pub fn new(topic: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_contract(mut self, contract: u32) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A committed entry yielded by the items iterator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub topic: Vec<u8>,
    pub value: Vec<u8>,
    pub expires_at: u32,
}

#[derive(Debug, Default)]
pub(crate) struct DbInfo {
    pub seq: AtomicU64,
    pub count: AtomicU64,
    pub n_buckets: AtomicU32,
}

/// Cursor state of one sync cycle, guarded by the exclusive sync lock.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    pub last_sync_seq: u64,
}

pub(crate) struct Core {
    pub(crate) opts: Options,
    path: PathBuf,
    _lock: FileLock,
    main: Fio,
    pub(crate) index: Fio,
    pub(crate) data: DataFile,
    pub(crate) window: TimeWindowBucket,
    pub(crate) wal: Wal,
    pub(crate) trie: Trie,
    pub(crate) mem: MemDb,
    pub(crate) filter: Mutex<Filter>,
    filter_fio: Fio,
    pub(crate) meter: Meter,
    pub(crate) info: DbInfo,
    pub(crate) cache_id: u64,
    cipher: Arc<dyn Cipher>,
    pub(crate) buf_pool: BufferPool,
    pub(crate) sync_mu: Mutex<SyncState>,
    closed: AtomicBool,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Core {
    pub(crate) fn ok(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.info.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn decount(&self, n: u64) {
        let _ = self
            .info
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(n))
            });
    }

    pub(crate) fn write_header(&self) -> Result<()> {
        let header = DbHeader {
            signature: MAIN_SIGNATURE,
            version: MAIN_VERSION,
            seq: self.info.seq.load(Ordering::Acquire),
            count: self.info.count.load(Ordering::Acquire),
            n_buckets: self.info.n_buckets.load(Ordering::Acquire),
            window_idx: self.window.window_index(),
        };
        self.main.write_at(&header.encode(), 0)?;
        self.main.sync()
    }

    fn contract_or_default(contract: u32) -> u32 {
        if contract == 0 {
            DEFAULT_CONTRACT
        } else {
            contract
        }
    }

    fn put_entry(&self, e: Entry) -> Result<()> {
        self.ok()?;
        let topic = Topic::parse(&e.topic)?;
        let contract = Self::contract_or_default(e.contract);
        let hash = topic.hash(contract);
        let expires_at = topic.ttl.unwrap_or(e.expires_at);

        let seq = match &e.id {
            Some(id) => entry::seq_from_id(id)?,
            None => self.next_seq(),
        };
        if seq == 0 {
            return errdata!("message id carries no sequence");
        }
        self.info.seq.fetch_max(seq, Ordering::AcqRel);

        let value = self.cipher.encrypt(&e.payload);
        let record = IndexEntry {
            seq,
            msg_offset: 0,
            topic_size: topic.path.len() as u16,
            value_size: value.len() as u32,
            expires_at,
            contract,
        };
        let mut slab = Vec::with_capacity(ENTRY_SIZE + topic.path.len() + value.len());
        slab.extend_from_slice(&record.encode());
        slab.extend_from_slice(&topic.path);
        slab.extend_from_slice(&value);

        // Staged and queryable first, durable before the put returns.
        self.mem.set(seq, self.cache_id ^ seq, &slab)?;
        let mut writer = self.wal.new_writer()?;
        writer.append(&slab)?;
        writer.sign_init_write(seq)?;

        let (parts, depth) = topic.contract_parts(contract);
        self.trie.add(hash, &parts, depth);
        self.window.add(hash, WinEntry { seq, expires_at })?;

        Meter::inc(&self.meter.puts, 1);
        Meter::inc(&self.meter.in_msgs, 1);
        Meter::inc(&self.meter.in_bytes, e.payload.len() as u64);
        Ok(())
    }

    fn get(&self, query: &Query) -> Result<Vec<Vec<u8>>> {
        self.ok()?;
        let topic = Topic::parse(&query.topic)?;
        let contract = Self::contract_or_default(query.contract);
        let limit = if query.limit > 0 {
            query.limit
        } else {
            topic.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
        };
        let cutoff = topic.last.unwrap_or(0);

        let (parts, depth) = topic.contract_parts(contract);
        let mut found: Vec<(u64, Vec<u8>)> = Vec::new();
        for handle in self.trie.lookup(&parts, depth, topic.kind) {
            for we in self.window.lookup(handle.hash, handle.offset, cutoff, limit) {
                if let Some(value) = self.read_value(we)? {
                    found.push((we.seq, value));
                }
            }
        }

        // Reverse time order across all matched topics.
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.dedup_by_key(|(seq, _)| *seq);
        found.truncate(limit);

        Meter::inc(&self.meter.gets, 1);
        let out_bytes: usize = found.iter().map(|(_, v)| v.len()).sum();
        Meter::inc(&self.meter.out_bytes, out_bytes as u64);
        Ok(found.into_iter().map(|(_, v)| v).collect())
    }

    /// Resolves a window entry to its payload, from the staging store when
    /// still resident, otherwise from the index and data files. Deleted and
    /// expired entries resolve to `None`.
    fn read_value(&self, we: WinEntry) -> Result<Option<Vec<u8>>> {
        match self.mem.get(we.seq, self.cache_id ^ we.seq) {
            Ok(Some(slab)) => {
                let record = IndexEntry::decode(&slab)?;
                if record.is_expired() {
                    return Ok(None);
                }
                let start = ENTRY_SIZE + record.topic_size as usize;
                let end = start + record.value_size as usize;
                if slab.len() < end {
                    return errdata!("staged record truncated for seq {}", we.seq);
                }
                Ok(Some(self.cipher.decrypt(&slab[start..end])))
            }
            Err(Error::EntryDeleted) => Ok(None),
            Err(err) => Err(err),
            Ok(None) => {
                let n_buckets = self.info.n_buckets.load(Ordering::Acquire);
                let Some(record) = index::read_entry(&self.index, n_buckets, we.seq)? else {
                    return Ok(None);
                };
                if record.is_deleted() || record.is_expired() {
                    return Ok(None);
                }
                let (_, value) = self.data.read_message(&record)?;
                Ok(Some(self.cipher.decrypt(&value)))
            }
        }
    }

    fn delete(&self, id: &[u8], topic: &[u8]) -> Result<()> {
        self.ok()?;
        if !self.opts.mutable {
            return Err(Error::ReadOnly);
        }
        let seq = entry::seq_from_id(id)?;
        let topic = Topic::parse(topic)?;
        // The contract is embedded in the id's durable record; the topic
        // only locates the in-memory window entries.
        let mut hashes = vec![topic.hash(DEFAULT_CONTRACT)];

        self.mem.remove(seq, self.cache_id ^ seq)?;

        let present = self.filter.lock()?.test(seq);
        if present {
            let n_buckets = self.info.n_buckets.load(Ordering::Acquire);
            if let Some(old) = index::tombstone(&self.index, n_buckets, seq)? {
                hashes.push(topic.hash(old.contract));
                self.data.free(&old)?;
                self.decount(1);
            }
        }
        for hash in hashes {
            self.window.remove(hash, seq)?;
        }
        Meter::inc(&self.meter.deletes, 1);
        Ok(())
    }

    fn varz(&self) -> Result<Varz> {
        self.ok()?;
        Ok(Varz::snapshot(
            &self.meter,
            self.info.seq.load(Ordering::Acquire),
            self.info.count.load(Ordering::Acquire),
            self.mem.size(),
        ))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(scheduler) = self.scheduler.lock()?.take() {
            scheduler.signal();
        }

        // Final sync; the sync lock also waits out an in-flight cycle.
        let synced = dbsync::sync(self, true);
        if let Err(ref err) = synced {
            tracing::error!(error = %err, "final sync on close failed");
        }

        self.data.save_lease()?;
        self.filter.lock()?.save(&self.filter_fio)?;
        self.write_header()?;
        self.wal.close()?;
        synced
    }

    fn warm_trie(&self) -> Result<()> {
        // newest block offset and candidate seqs per topic hash
        let mut newest: std::collections::HashMap<u64, (i64, Vec<u64>)> =
            std::collections::HashMap::new();
        self.window.foreach_window_block(|block, off| {
            if block.topic_hash == 0 && block.entry_idx == 0 {
                return Ok(false);
            }
            let slot = newest.entry(block.topic_hash).or_insert((0, Vec::new()));
            if off > slot.0 {
                slot.0 = off;
            }
            if let Some(e) = block.entries[..block.entry_idx as usize]
                .iter()
                .find(|e| e.seq != 0)
            {
                slot.1.push(e.seq);
            }
            Ok(false)
        })?;

        let n_buckets = self.info.n_buckets.load(Ordering::Acquire);
        for (hash, (off, candidates)) in newest {
            for seq in candidates {
                let Some(record) = index::read_entry(&self.index, n_buckets, seq)? else {
                    continue;
                };
                let Ok(topic_bytes) = self.data.read_topic(&record) else {
                    continue;
                };
                let Ok(topic) = Topic::parse(&topic_bytes) else {
                    continue;
                };
                let (parts, depth) = topic.contract_parts(record.contract);
                self.trie.add(hash, &parts, depth);
                self.trie.set_offset(hash, off);
                break;
            }
        }
        Ok(())
    }
}

/// An embedded time-series store for topic-addressed messages.
///
/// Entries become queryable as soon as `put` returns (staged in memory and
/// durable in the write-ahead log) and move into the index, data and window
/// files on the next sync.
pub struct Db {
    core: Arc<Core>,
}

impl Db {
    /// Opens or creates a database under the given directory.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let lock = FileLock::lock(path.join("LOCK"))?;

        let main = Fio::open(path.join("main"))?;
        let header = if main.size() == 0 {
            let header = DbHeader::default();
            main.write_at(&header.encode(), 0)?;
            main.sync()?;
            header
        } else {
            DbHeader::decode(&main.slice(0, MAIN_HEADER_SIZE as i64)?)?
        };

        let index = Fio::open(path.join("index"))?;
        let data = DataFile::open(
            Fio::open(path.join("data"))?,
            Fio::open(path.join("lease"))?,
            opts.free_block_size,
        )?;
        let window = TimeWindowBucket::open(
            Fio::open(path.join("window"))?,
            TimeOptions {
                background_key_expiry: opts.background_key_expiry,
                ..TimeOptions::default()
            },
        )?;
        let (wal, needs_recovery) = Wal::open(WalOptions {
            dir: path.join("wal"),
            buffer_size: opts.buffer_size,
        })?;
        let filter_fio = Fio::open(path.join("filter"))?;
        let filter = Filter::load(&filter_fio)?;

        let info = DbInfo {
            seq: AtomicU64::new(header.seq.max(wal.seq())),
            count: AtomicU64::new(header.count),
            n_buckets: AtomicU32::new(header.n_buckets),
        };

        let cipher: Arc<dyn Cipher> = opts
            .encryption
            .clone()
            .unwrap_or_else(|| Arc::new(Passthrough));
        let buf_pool = BufferPool::new(opts.buffer_size);
        let mem = MemDb::open(opts.memdb_size);

        let core = Arc::new(Core {
            opts,
            path,
            _lock: lock,
            main,
            index,
            data,
            window,
            wal,
            trie: Trie::new(),
            mem,
            filter: Mutex::new(filter),
            filter_fio,
            meter: Meter::default(),
            info,
            cache_id: rand::random(),
            cipher,
            buf_pool,
            sync_mu: Mutex::new(SyncState::default()),
            closed: AtomicBool::new(false),
            scheduler: Mutex::new(None),
        });

        core.warm_trie()?;
        if needs_recovery {
            dbsync::replay_logs(&core)?;
        }

        // Background workers need a reactor; without one the database runs
        // in manual-sync mode.
        if tokio::runtime::Handle::try_current().is_ok() {
            let scheduler = Scheduler::new();
            scheduler.register(Arc::new(SyncTask::new(Arc::downgrade(&core))));
            scheduler.register(Arc::new(DrainTask::new(Arc::downgrade(&core))));
            if core.opts.background_key_expiry {
                scheduler.register(Arc::new(ExpiryTask::new(Arc::downgrade(&core))));
            }
            *core.scheduler.lock()? = Some(scheduler);
        }

        tracing::info!(path = %core.path.display(), "database open");
        Ok(Db { core })
    }

    /// Issues a new contract.
    pub fn new_contract(&self) -> Result<u32> {
        self.core.ok()?;
        loop {
            let contract: u32 = rand::random();
            if contract != 0 && contract != DEFAULT_CONTRACT {
                return Ok(contract);
            }
        }
    }

    /// Issues a message ID carrying a fresh sequence. Entries put with this
    /// ID can later be deleted through it.
    pub fn new_id(&self) -> Vec<u8> {
        entry::make_id(self.core.next_seq(), 0)
    }

    /// Stores a payload under a topic.
    pub fn put(&self, topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.core.put_entry(Entry::new(topic.into(), payload.into()))
    }

    /// Stores an entry.
    pub fn put_entry(&self, entry: Entry) -> Result<()> {
        self.core.put_entry(entry)
    }

    /// Returns matching payloads in reverse time order.
    pub fn get(&self, query: &Query) -> Result<Vec<Vec<u8>>> {
        self.core.get(query)
    }

    /// Soft-deletes the entry behind a message ID. Requires a mutable
    /// database.
    pub fn delete(&self, id: &[u8], topic: &[u8]) -> Result<()> {
        self.core.delete(id, topic)
    }

    /// Collects entries in a batch and commits them together when the
    /// closure succeeds.
    pub fn batch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch) -> Result<()>,
    {
        self.core.ok()?;
        let mut batch = Batch::default();
        f(&mut batch)?;
        for entry in batch.entries {
            self.core.put_entry(entry)?;
        }
        Ok(())
    }

    /// Drains staged entries into the index, data and window files.
    pub fn sync(&self) -> Result<()> {
        dbsync::sync(&self.core, false)
    }

    /// Replays unapplied logs into the staging layers and syncs.
    pub fn recover_log(&self) -> Result<()> {
        dbsync::recover_log(&self.core)
    }

    /// Removes entries past their TTL from the trie, index and data files.
    pub fn expire_entries(&self) -> Result<()> {
        dbsync::expire_entries(&self.core, MAX_EXPIRY_RESULTS)
    }

    /// Number of committed entries.
    pub fn count(&self) -> u64 {
        self.core.info.count.load(Ordering::Acquire)
    }

    /// Counter snapshot.
    pub fn varz(&self) -> Result<Varz> {
        self.core.varz()
    }

    /// Iterates committed entries in unspecified order.
    pub fn items(&self) -> ItemIterator {
        ItemIterator {
            core: self.core.clone(),
            next_bucket: 0,
            queue: VecDeque::new(),
            failed: false,
        }
    }

    /// Flushes, signals background workers, and releases the directory.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(err) = self.core.close() {
            tracing::error!(error = %err, "close on drop failed");
        }
    }
}

/// Buffer of entries committed together by `Db::batch`.
#[derive(Debug, Default)]
pub struct Batch {
    entries: Vec<Entry>,
}

impl Batch {
    pub fn put(&mut self, topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.put_entry(Entry::new(topic.into(), payload.into()))
    }

    pub fn put_entry(&mut self, entry: Entry) -> Result<()> {
        self.entries.push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Iterator over committed entries, walking index buckets in order.
pub struct ItemIterator {
    core: Arc<Core>,
    next_bucket: u32,
    queue: VecDeque<Item>,
    failed: bool,
}

impl Iterator for ItemIterator {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(Ok(item));
            }
            let n_buckets = self.core.info.n_buckets.load(Ordering::Acquire);
            if self.next_bucket >= n_buckets {
                return None;
            }
            let bucket = match index::read_bucket(&self.core.index, self.next_bucket) {
                Ok(bucket) => bucket,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            self.next_bucket += 1;
            for record in &bucket.entries[..bucket.len()] {
                if record.is_deleted() || record.is_expired() {
                    continue;
                }
                match self.core.data.read_message(record) {
                    Ok((topic, value)) => self.queue.push_back(Item {
                        topic,
                        value: self.core.cipher.decrypt(&value),
                        expires_at: record.expires_at,
                    }),
                    Err(Error::EntryDeleted) => continue,
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_header_roundtrip() {
        let header = DbHeader {
            signature: MAIN_SIGNATURE,
            version: MAIN_VERSION,
            seq: 1234,
            count: 99,
            n_buckets: 7,
            window_idx: 3,
        };
        let buf = header.encode();
        assert_eq!(buf.len(), MAIN_HEADER_SIZE);
        assert_eq!(DbHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_db_header_validation() {
        let mut buf = DbHeader::default().encode();
        buf[0] = b'X';
        assert!(DbHeader::decode(&buf).is_err());

        let mut buf = DbHeader::default().encode();
        LittleEndian::write_u32(&mut buf[8..12], 99);
        assert!(DbHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_query_builder() {
        let q = Query::new(&b"a.b"[..]).with_contract(7).with_limit(5);
        assert_eq!(q.topic, b"a.b");
        assert_eq!(q.contract, 7);
        assert_eq!(q.limit, 5);
    }
}
