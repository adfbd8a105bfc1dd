use std::sync::atomic::Ordering;

use crate::data::DataWriter;
use crate::db::{Core, SyncState};
use crate::entry::{IndexEntry, ENTRY_SIZE};
use crate::errdata;
use crate::error::Result;
use crate::index::{BlockWriter, BUCKET_SIZE};
use crate::meter::Meter;
use crate::timewindow::{WinEntry, WindowWriter};
use crate::topic::Topic;
use crate::Error;

/// Drains the staging store into the index, data and window files. Runs
/// under the exclusive sync lock, serializing against expiry and close. A
/// failed cycle escalates to recovery; a failed recovery is fatal.
pub(crate) fn sync(core: &Core, closing: bool) -> Result<()> {
    let mut state = core.sync_mu.lock()?;
    if !closing {
        core.ok()?;
    }
    match sync_locked(core, &mut state) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "sync failed; starting recovery");
            Meter::inc(&core.meter.errors, 1);
            start_recovery(core, &mut state)
        }
    }
}

fn sync_locked(core: &Core, state: &mut SyncState) -> Result<()> {
    let seq_now = core.info.seq.load(Ordering::Acquire);
    if state.last_sync_seq == seq_now {
        return Ok(());
    }
    state.last_sync_seq = seq_now;

    let mut window_writer = WindowWriter::new(&core.window, core.buf_pool.get());
    let mut block_writer = BlockWriter::new(
        &core.index,
        core.info.n_buckets.load(Ordering::Acquire),
        core.buf_pool.get(),
    );
    let mut data_writer = DataWriter::new(&core.data, core.buf_pool.get());
    let mut upper_seq = 0u64;
    let mut staged_seqs: Vec<u64> = Vec::new();

    // Stage every shard's entries first. Nothing may be flushed or marked
    // applied yet: shards are keyed by topic hash, not sequence, so an
    // early shard can carry a higher seq than an entry still buffered in a
    // later shard, and signalling per shard would mark that entry's log
    // applied before it ever reaches the index.
    let result = core.window.foreach_time_window(true, |windows| {
        for (&hash, entries) in windows {
            if entries.is_empty() {
                continue;
            }
            // The offset was linked at put time; a missing one means the
            // trie and window have diverged.
            let Some(prev_off) = core.trie.get_offset(hash) else {
                return errdata!("no window offset in trie for topic hash {hash}");
            };
            let new_off = window_writer.append(hash, prev_off, entries)?;
            if !core.trie.set_offset(hash, new_off) {
                return errdata!("topic hash {hash} vanished from trie during sync");
            }

            for we in entries {
                if we.seq == 0 {
                    continue;
                }
                staged_seqs.push(we.seq);
                let slab = match core.mem.get(we.seq, core.cache_id ^ we.seq) {
                    Ok(Some(slab)) => slab,
                    // Already durable from an earlier cycle or replay.
                    Ok(None) => continue,
                    // Deleted before it ever reached disk.
                    Err(Error::EntryDeleted) => continue,
                    Err(err) => return Err(err),
                };
                let mut record = IndexEntry::decode(&slab)?;
                record.msg_offset = data_writer.write_message(&slab[ENTRY_SIZE..])?;
                let exists = block_writer.append(record)?;
                if !exists {
                    core.filter.lock()?.append(we.seq);
                    core.info.count.fetch_add(1, Ordering::AcqRel);
                }
                if upper_seq < we.seq {
                    upper_seq = we.seq;
                }
            }
        }
        Ok(false)
    });

    // One flush covering the whole cycle, so the applied signal only fires
    // once every entry with seq <= upper_seq is durable.
    let result = result.and_then(|()| {
        flush(core, &mut window_writer, &mut block_writer, &mut data_writer, upper_seq)
    });

    if let Err(err) = result {
        if let Err(rb) = window_writer.rollback() {
            tracing::error!(error = %rb, "window rollback failed");
        }
        core.buf_pool.put(window_writer.into_buffer());
        core.buf_pool.put(block_writer.into_buffer());
        core.buf_pool.put(data_writer.into_buffer());
        return Err(err);
    }

    // Flushed records may now be reclaimed from the staging store.
    for seq in staged_seqs {
        core.mem.free(seq, core.cache_id ^ seq)?;
    }

    Meter::inc(&core.meter.syncs, 1);
    core.buf_pool.put(window_writer.into_buffer());
    core.buf_pool.put(block_writer.into_buffer());
    core.buf_pool.put(data_writer.into_buffer());
    Ok(())
}

/// Flush order matters: grow the index, land blocks and data, then the
/// window chain, then the header, fsync everything, and only then signal
/// the log applied.
fn flush(
    core: &Core,
    window_writer: &mut WindowWriter,
    block_writer: &mut BlockWriter,
    data_writer: &mut DataWriter,
    upper_seq: u64,
) -> Result<()> {
    let added = block_writer.count();
    if added > 0 {
        core.index.extend(added as i64 * BUCKET_SIZE as i64)?;
    }
    block_writer.write()?;
    let absorbed = block_writer.flushed();
    core.info.n_buckets.fetch_add(absorbed, Ordering::AcqRel);

    data_writer.write()?;
    window_writer.write()?;

    core.write_header()?;
    core.index.sync()?;
    core.data.sync()?;
    core.window.sync()?;

    if upper_seq > 0 {
        core.wal.signal_log_applied(upper_seq)?;
    }
    Ok(())
}

/// Rebuilds the staging layers from written-but-unapplied logs. Every
/// frame carries the full entry record, topic and value, so the trie and
/// window can be rebuilt without touching the data files.
pub(crate) fn replay_logs(core: &Core) -> Result<()> {
    let logs = core.wal.scan()?;
    let mut replayed = 0u64;
    for (info, frames) in &logs {
        for frame in frames {
            let record = IndexEntry::decode(frame)?;
            let topic_end = ENTRY_SIZE + record.topic_size as usize;
            if frame.len() < topic_end {
                return errdata!("log frame truncated for seq {}", record.seq);
            }
            let topic = Topic::parse(&frame[ENTRY_SIZE..topic_end])?;
            let hash = topic.hash(record.contract);

            let key = core.cache_id ^ record.seq;
            match core.mem.get(record.seq, key) {
                Ok(Some(_)) => {}
                Ok(None) => core.mem.set(record.seq, key, frame)?,
                Err(Error::EntryDeleted) => continue,
                Err(err) => return Err(err),
            }
            let (parts, depth) = topic.contract_parts(record.contract);
            core.trie.add(hash, &parts, depth);
            // Replace rather than duplicate a still-buffered entry.
            core.window.remove(hash, record.seq)?;
            core.window.add(
                hash,
                WinEntry {
                    seq: record.seq,
                    expires_at: record.expires_at,
                },
            )?;
            core.info.seq.fetch_max(record.seq, Ordering::AcqRel);
            replayed += 1;
        }
        tracing::info!(seq = info.seq, entries = info.entry_count, "log replayed");
    }
    if replayed > 0 {
        tracing::warn!(entries = replayed, "staging store rebuilt from log");
    }
    Ok(())
}

/// Replay then re-sync. A failure here means the log itself cannot restore
/// a consistent state, which is unrecoverable.
fn start_recovery(core: &Core, state: &mut SyncState) -> Result<()> {
    Meter::inc(&core.meter.recoveries, 1);
    if let Err(err) = replay_logs(core) {
        panic!("recovery failed: {err}; closing database");
    }
    state.last_sync_seq = 0;
    match sync_locked(core, state) {
        Ok(()) => Ok(()),
        Err(err) => panic!("recovery failed: {err}; closing database"),
    }
}

/// Public recovery entry point: replay unapplied logs, then sync.
pub(crate) fn recover_log(core: &Core) -> Result<()> {
    core.ok()?;
    replay_logs(core)?;
    sync(core, false)
}

/// Removes entries past their TTL: drains the expiry index, then detaches
/// each entry from the trie, tombstones its record and frees its data.
pub(crate) fn expire_entries(core: &Core, max: usize) -> Result<()> {
    let _state = core.sync_mu.lock()?;
    core.ok()?;

    let expired = core.window.expire_old_entries(max);
    if expired.is_empty() {
        return Ok(());
    }
    let n_buckets = core.info.n_buckets.load(Ordering::Acquire);
    for we in expired {
        if !core.filter.lock()?.test(we.seq) {
            continue;
        }
        let Some(record) = crate::index::read_entry(&core.index, n_buckets, we.seq)? else {
            continue;
        };
        if record.is_deleted() {
            continue;
        }
        let topic_bytes = match core.data.read_topic(&record) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        let Ok(topic) = Topic::parse(&topic_bytes) else {
            continue;
        };
        core.trie.remove(topic.hash(record.contract));
        crate::index::tombstone(&core.index, n_buckets, we.seq)?;
        core.data.free(&record)?;
        core.decount(1);
        Meter::inc(&core.meter.expired, 1);
    }
    Ok(())
}
