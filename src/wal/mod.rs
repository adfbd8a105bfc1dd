//! Write-ahead log.
//!
//! A segment file begins with a signed 70-byte header tracking the highest
//! committed sequence and up to three reusable free ranges. Logs follow:
//! each is a 32-byte info record and a packed run of `[len u32 LE][payload]`
//! frames, where `len` includes its own four bytes. A log transitions
//! `new -> written` when its writer commits and `written -> applied` once
//! the sync pipeline has moved its entries into the index, data and window
//! files. A fully-applied segment is truncated back to its header.

pub mod header;
pub mod writer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::bufpool::BufferPool;
use crate::errdata;
use crate::error::Result;
use crate::fio::Fio;
use crate::Error;

use header::{FreeBlock, Header, LogInfo, LogStatus, LOG_INFO_SIZE, LOG_VERSION, WAL_HEADER_SIZE};
pub use writer::LogWriter;

const SEGMENT_NAME: &str = "00000001.log";

#[derive(Clone, Debug)]
pub struct WalOptions {
    pub dir: PathBuf,
    pub buffer_size: usize,
}

#[derive(Debug)]
struct WalInner {
    file: Fio,
    header: Header,
    logs: Vec<LogInfo>,
}

/// Segmented write-ahead log. A single mutex guards segment writes; readers
/// of committed state go through `scan`.
#[derive(Debug)]
pub struct Wal {
    inner: Mutex<WalInner>,
    buf_pool: BufferPool,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl Wal {
    /// Opens the log directory, scanning the segment for logs. Returns the
    /// log and whether any written-but-unapplied logs need replay.
    pub fn open(opts: WalOptions) -> Result<(Self, bool)> {
        std::fs::create_dir_all(&opts.dir)?;
        let file = Fio::open(opts.dir.join(SEGMENT_NAME))?;

        let header = if file.size() == 0 {
            let header = Header::default();
            file.write_at(&header.encode(), 0)?;
            file.sync()?;
            header
        } else {
            Header::decode(&file.slice(0, WAL_HEADER_SIZE as i64)?)?
        };

        let mut logs = Vec::new();
        let mut off = WAL_HEADER_SIZE as i64;
        let size = file.size();
        while off + LOG_INFO_SIZE as i64 <= size {
            let info = match LogInfo::decode(&file.slice(off, off + LOG_INFO_SIZE as i64)?) {
                Ok(info) => info,
                Err(_) => break,
            };
            if info.version != LOG_VERSION
                || info.size <= 0
                || info.offset != off
                || off + LOG_INFO_SIZE as i64 + info.size > size
            {
                break;
            }
            // Records with no entries pad reused free ranges.
            if info.entry_count > 0 {
                logs.push(info);
            }
            off += LOG_INFO_SIZE as i64 + info.size;
        }
        // Anything past the last well-formed log is a torn write that was
        // never acknowledged; discard it so later appends stay scannable.
        if off < size {
            file.truncate(off)?;
            file.sync()?;
        }

        let top_seq = logs
            .iter()
            .map(|l| l.seq)
            .max()
            .unwrap_or(0)
            .max(header.seq);
        let needs_recovery = logs.iter().any(|l| l.status == LogStatus::Written);

        let wal = Self {
            inner: Mutex::new(WalInner { file, header, logs }),
            buf_pool: BufferPool::new(opts.buffer_size),
            seq: AtomicU64::new(top_seq),
            closed: AtomicBool::new(false),
        };

        if !needs_recovery {
            // Everything already applied: the segment is eligible for
            // truncation.
            let mut inner = wal.inner.lock()?;
            if !inner.logs.is_empty() {
                wal.recycle(&mut inner)?;
            }
        }
        Ok((wal, needs_recovery))
    }

    fn ok(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Highest sequence committed to the log.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Returns an append-only writer for one log.
    pub fn new_writer(&self) -> Result<LogWriter<'_>> {
        self.ok()?;
        Ok(LogWriter::new(self, self.buf_pool.get()))
    }

    pub(crate) fn release_buffer(&self, buf: Vec<u8>) {
        self.buf_pool.put(buf);
    }

    /// Writes one log into a free range when it fits, otherwise at the end
    /// of the segment, and makes it durable before returning.
    pub(crate) fn put(&self, mut info: LogInfo, payload: &[u8]) -> Result<()> {
        self.ok()?;
        let mut inner = self.inner.lock()?;

        let need = (LOG_INFO_SIZE + payload.len()) as i64;
        let mut slot: Option<(usize, i64)> = None;
        for (i, fb) in inner.header.free_blocks.iter().enumerate() {
            if fb.size == need {
                slot = Some((i, 0));
                break;
            }
            // Leftover space must fit a padding record to keep the segment
            // scannable.
            if slot.is_none() && fb.size >= need + LOG_INFO_SIZE as i64 {
                slot = Some((i, fb.size - need));
            }
        }

        let offset = match slot {
            Some((i, _)) => {
                let fb = inner.header.free_blocks[i];
                inner.header.free_blocks[i] = FreeBlock::default();
                fb.offset
            }
            None => inner.file.size(),
        };
        info.offset = offset;

        let mut buf = self.buf_pool.get();
        buf.extend_from_slice(&info.encode());
        buf.extend_from_slice(payload);
        if let Some((_, remainder)) = slot {
            if remainder > 0 {
                let filler = LogInfo {
                    status: LogStatus::Applied,
                    size: remainder - LOG_INFO_SIZE as i64,
                    offset: offset + need,
                    ..LogInfo::default()
                };
                buf.extend_from_slice(&filler.encode());
            }
        }
        inner.file.write_at(&buf, offset)?;
        self.buf_pool.put(buf);

        self.seq.fetch_max(info.seq, Ordering::AcqRel);
        inner.header.seq = inner.header.seq.max(info.seq);
        let head = inner.header.encode();
        inner.file.write_at(&head, 0)?;
        inner.file.sync()?;

        inner.logs.push(info);
        Ok(())
    }

    /// Marks every written log with `seq <= upper_seq` applied, persists
    /// the transitions, and releases their space to the free-block table.
    /// A fully-applied segment is recycled.
    pub fn signal_log_applied(&self, upper_seq: u64) -> Result<()> {
        self.ok()?;
        let mut inner = self.inner.lock()?;

        let mut freed: Vec<FreeBlock> = inner
            .header
            .free_blocks
            .iter()
            .copied()
            .filter(|f| f.size > 0)
            .collect();
        let mut changed = false;
        for i in 0..inner.logs.len() {
            let mut log = inner.logs[i];
            if log.status == LogStatus::Written && log.seq <= upper_seq {
                log.status = LogStatus::Applied;
                inner.file.write_at(&log.encode(), log.offset)?;
                inner.logs[i] = log;
                freed.push(FreeBlock {
                    size: LOG_INFO_SIZE as i64 + log.size,
                    offset: log.offset,
                });
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }

        if inner.logs.iter().all(|l| l.status == LogStatus::Applied) {
            return self.recycle(&mut inner);
        }

        // Sorted and coalesced; only the three largest ranges are kept.
        freed.sort_by_key(|f| f.offset);
        let mut merged: Vec<FreeBlock> = Vec::new();
        for f in freed {
            match merged.last_mut() {
                Some(last) if last.offset + last.size == f.offset => last.size += f.size,
                _ => merged.push(f),
            }
        }
        merged.sort_by(|a, b| b.size.cmp(&a.size));
        merged.truncate(3);
        merged.sort_by_key(|f| f.offset);
        let mut free_blocks = [FreeBlock::default(); 3];
        for (i, f) in merged.into_iter().enumerate() {
            free_blocks[i] = f;
        }
        inner.header.free_blocks = free_blocks;
        inner.header.seq = self.seq();
        let head = inner.header.encode();
        inner.file.write_at(&head, 0)?;
        inner.file.sync()?;
        Ok(())
    }

    fn recycle(&self, inner: &mut WalInner) -> Result<()> {
        inner.logs.clear();
        inner.header.free_blocks = [FreeBlock::default(); 3];
        inner.header.seq = self.seq();
        inner.file.truncate(WAL_HEADER_SIZE as i64)?;
        let head = inner.header.encode();
        inner.file.write_at(&head, 0)?;
        inner.file.sync()?;
        Ok(())
    }

    /// Returns the frames of every written-but-unapplied log, ordered by
    /// log sequence. Used by replay.
    pub fn scan(&self) -> Result<Vec<(LogInfo, Vec<Vec<u8>>)>> {
        let inner = self.inner.lock()?;
        let mut out = Vec::new();
        for log in inner.logs.iter().filter(|l| l.status == LogStatus::Written) {
            let payload = inner.file.slice(
                log.offset + LOG_INFO_SIZE as i64,
                log.offset + LOG_INFO_SIZE as i64 + log.size,
            )?;
            let mut frames = Vec::with_capacity(log.entry_count as usize);
            let mut pos = 0usize;
            while pos + 4 <= payload.len() {
                let frame_len = LittleEndian::read_u32(&payload[pos..pos + 4]) as usize;
                if frame_len < 4 || pos + frame_len > payload.len() {
                    return errdata!("corrupt log frame at offset {}", log.offset + pos as i64);
                }
                frames.push(payload[pos + 4..pos + frame_len].to_vec());
                pos += frame_len;
            }
            out.push((*log, frames));
        }
        out.sort_by_key(|(log, _)| log.seq);
        Ok(out)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock()?.file.sync()
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut inner = self.inner.lock()?;
        inner.header.seq = self.seq();
        let head = inner.header.encode();
        inner.file.write_at(&head, 0)?;
        inner.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_wal(dir: &TempDir) -> (Wal, bool) {
        Wal::open(WalOptions {
            dir: dir.path().join("wal"),
            buffer_size: 1 << 12,
        })
        .expect("open wal")
    }

    fn put_log<T: AsRef<[u8]>>(wal: &Wal, seq: u64, frames: &[T]) {
        let mut writer = wal.new_writer().expect("writer");
        for frame in frames {
            writer.append(frame.as_ref()).expect("append");
        }
        writer.sign_init_write(seq).expect("commit");
    }

    #[test]
    fn test_commit_and_scan() {
        let dir = TempDir::new().unwrap();
        let (wal, needs_recovery) = open_wal(&dir);
        assert!(!needs_recovery);

        put_log(&wal, 2, &[b"one", b"two"]);
        put_log(&wal, 3, &[b"three"]);
        assert_eq!(wal.seq(), 3);

        let logs = wal.scan().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].0.seq, 2);
        assert_eq!(logs[0].1, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(logs[1].0.seq, 3);
        assert_eq!(logs[1].1, vec![b"three".to_vec()]);
    }

    #[test]
    fn test_reopen_scans_unapplied_logs() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open_wal(&dir);
            put_log(&wal, 5, &[b"payload"]);
            wal.close().unwrap();
        }
        let (wal, needs_recovery) = open_wal(&dir);
        assert!(needs_recovery);
        let logs = wal.scan().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].0.seq, 5);
        assert_eq!(logs[0].1, vec![b"payload".to_vec()]);
    }

    #[test]
    fn test_applied_segment_recycles() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);
        put_log(&wal, 1, &[b"a"]);
        put_log(&wal, 2, &[b"b"]);

        wal.signal_log_applied(2).unwrap();
        assert!(wal.scan().unwrap().is_empty());

        // Fully applied: the segment is back to just its header.
        let inner = wal.inner.lock().unwrap();
        assert_eq!(inner.file.size(), WAL_HEADER_SIZE as i64);
        assert_eq!(inner.header.seq, 2);
        drop(inner);

        // Sequences survive the recycle.
        put_log(&wal, 3, &[b"c"]);
        assert_eq!(wal.seq(), 3);
    }

    #[test]
    fn test_partial_apply_frees_blocks() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);
        put_log(&wal, 1, &[b"aaaaaaaa"]);
        put_log(&wal, 2, &[b"bbbbbbbb"]);

        wal.signal_log_applied(1).unwrap();
        let logs = wal.scan().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].0.seq, 2);

        let size_before = {
            let inner = wal.inner.lock().unwrap();
            assert!(inner.header.free_blocks[0].size > 0);
            inner.file.size()
        };

        // The next equally-sized log reuses the freed range.
        put_log(&wal, 3, &[b"cccccccc"]);
        let inner = wal.inner.lock().unwrap();
        assert_eq!(inner.file.size(), size_before);
    }

    #[test]
    fn test_closed_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);
        wal.close().unwrap();
        assert!(matches!(wal.new_writer(), Err(Error::Closed)));
    }

    #[test]
    fn test_empty_writer_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);
        let writer = wal.new_writer().unwrap();
        writer.sign_init_write(9).unwrap();
        assert!(wal.scan().unwrap().is_empty());
        assert_eq!(wal.seq(), 0);
    }
}
