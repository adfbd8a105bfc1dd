use std::sync::Arc;

use unitdb::tmpfs::TempDir;
use unitdb::{Cipher, Db, Entry, Error, Options, Query};

fn payload(i: usize) -> Vec<u8> {
    format!("msg.{i:03}").into_bytes()
}

/// Expected get result for `n` puts of `payload(0..n)`: newest first.
fn reversed(n: usize) -> Vec<Vec<u8>> {
    (0..n).rev().map(payload).collect()
}

#[test]
fn test_simple() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(
        dir.path(),
        Options::new()
            .with_buffer_size(1 << 4)
            .with_memdb_size(1 << 16)
            .with_free_block_size(1 << 16),
    )
    .expect("open");

    let n = 1000usize;
    let contract = db.new_contract().expect("contract");
    let topic = b"unit1.test".to_vec();

    assert_eq!(db.count(), 0);
    assert!(db
        .get(&Query::new(topic.clone()).with_contract(contract))
        .expect("get")
        .is_empty());

    let mut ids = Vec::new();
    for i in 0..n {
        let id = db.new_id();
        let entry = Entry::new(topic.clone(), payload(i))
            .with_id(id.clone())
            .with_contract(contract)
            .with_ttl("1m")
            .expect("ttl");
        db.put_entry(entry).expect("put");
        ids.push(id);
    }

    if db.count() != n as u64 {
        db.recover_log().expect("recover log");
    }
    assert_eq!(db.count(), n as u64);

    let got = db
        .get(
            &Query::new(b"unit1.test?last=1h".to_vec())
                .with_contract(contract)
                .with_limit(n),
        )
        .expect("get");
    assert_eq!(got, reversed(n));
    db.varz().expect("varz");
    db.close().expect("close");
    drop(db);

    // Reopen: the same entries come back from disk.
    let db = Db::open(dir.path(), Options::new().with_mutable()).expect("reopen");
    assert_eq!(db.count(), n as u64);
    let got = db
        .get(
            &Query::new(b"unit1.test?last=1h".to_vec())
                .with_contract(contract)
                .with_limit(n),
        )
        .expect("get after reopen");
    assert_eq!(got, reversed(n));

    // Deletes require the ids handed out at put time.
    for id in &ids {
        db.delete(id, &topic).expect("delete");
    }
    assert_eq!(db.count(), 0);
    assert!(db
        .get(&Query::new(topic.clone()).with_contract(contract).with_limit(n))
        .expect("get after delete")
        .is_empty());
}

#[test]
fn test_batch_and_restart() {
    let dir = TempDir::new().expect("temp dir");
    let n = 100usize;
    let contract;
    {
        let db = Db::open(
            dir.path(),
            Options::new()
                .with_buffer_size(1 << 16)
                .with_memdb_size(1 << 16)
                .with_free_block_size(1 << 16)
                .with_mutable(),
        )
        .expect("open");
        contract = db.new_contract().expect("contract");

        db.batch(|b| {
            for i in 0..n {
                b.put_entry(
                    Entry::new(&b"unit2.test?ttl=1h"[..], payload(i)).with_contract(contract),
                )?;
            }
            Ok(())
        })
        .expect("batch");

        db.sync().expect("sync");
        if db.count() != n as u64 {
            db.recover_log().expect("recover log");
        }
        assert_eq!(db.count(), n as u64);
        db.close().expect("close");
    }

    let db = Db::open(dir.path(), Options::new().with_mutable()).expect("reopen");
    if db.count() != n as u64 {
        db.recover_log().expect("recover log");
    }
    let got = db
        .get(
            &Query::new(b"unit2.test?last=1h".to_vec())
                .with_contract(contract)
                .with_limit(n),
        )
        .expect("get");
    assert_eq!(got, reversed(n));
}

#[tokio::test]
async fn test_expiry() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(
        dir.path(),
        Options::new().with_mutable().with_background_key_expiry(),
    )
    .expect("open");

    let contract = db.new_contract().expect("contract");
    let topic = b"unit4.test".to_vec();
    let n = 100usize;
    let expired_at = unitdb::clock::unix32() - 3600;

    db.batch(|b| {
        for i in 0..n {
            let mut entry = Entry::new(topic.clone(), payload(i)).with_contract(contract);
            entry.expires_at = expired_at;
            b.put_entry(entry)?;
        }
        Ok(())
    })
    .expect("batch");

    // Everything is already past its TTL.
    let got = db
        .get(&Query::new(topic.clone()).with_contract(contract).with_limit(n))
        .expect("get");
    assert!(got.is_empty());

    db.expire_entries().expect("expire");
}

#[test]
fn test_leasing_reuses_freed_blocks() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(
        dir.path(),
        Options::new()
            .with_buffer_size(1 << 16)
            .with_memdb_size(1 << 16)
            .with_free_block_size(1 << 4)
            .with_mutable(),
    )
    .expect("open");

    let topic = b"unit1.test".to_vec();
    let n = 100usize;

    let round = |db: &Db| {
        let mut ids = Vec::new();
        for i in 0..n {
            let id = db.new_id();
            db.put_entry(Entry::new(topic.clone(), payload(i)).with_id(id.clone()))
                .expect("put");
            ids.push(id);
        }
        db.sync().expect("sync");
        ids
    };

    let ids = round(&db);
    let data_size = std::fs::metadata(dir.path().join("data")).unwrap().len();
    for id in &ids {
        db.delete(id, &topic).expect("delete");
    }

    let ids = round(&db);
    // Freed slabs were reused: the data file did not grow.
    assert_eq!(
        std::fs::metadata(dir.path().join("data")).unwrap().len(),
        data_size
    );
    for id in &ids {
        db.delete(id, &topic).expect("delete");
    }
    db.sync().expect("sync");
    assert_eq!(
        std::fs::metadata(dir.path().join("data")).unwrap().len(),
        data_size
    );
}

#[tokio::test]
async fn test_wildcard_topics() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(
        dir.path(),
        Options::new()
            .with_buffer_size(1 << 16)
            .with_memdb_size(1 << 16)
            .with_free_block_size(1 << 16)
            .with_mutable(),
    )
    .expect("open");

    let tests: &[(&[u8], &[u8], &[u8])] = &[
        (b"...", b"unit.b.b1", b"...1"),
        (
            b"unit.b...",
            b"unit.b.b1.b11.b111.b1111.b11111.b111111",
            b"unit.b...1",
        ),
        (
            b"unit.*.b1.b11.*.*.b11111.*",
            b"unit.b.b1.b11.b111.b1111.b11111.b111111",
            b"unit.*.b1.b11.*.*.b11111.*.1",
        ),
        (
            b"unit.*.b1.*.*.*.b11111.*",
            b"unit.b.b1.b11.b111.b1111.b11111.b111111",
            b"unit.*.b1.*.*.*.b11111.*.1",
        ),
        (b"unit.b.b1", b"unit.b.b1", b"unit.b.b1.1"),
        (b"unit.b.b1.b11", b"unit.b.b1.b11", b"unit.b.b1.b11.1"),
        (b"unit.b", b"unit.b", b"unit.b.1"),
    ];

    for (wtopic, topic, msg) in tests {
        db.put(wtopic.to_vec(), msg.to_vec()).expect("put");
        let got = db
            .get(&Query::new(wtopic.to_vec()).with_limit(10))
            .expect("get wildcard");
        assert!(!got.is_empty(), "no match for wildcard query");
        assert!(got.contains(&msg.to_vec()));

        let got = db
            .get(&Query::new(topic.to_vec()).with_limit(10))
            .expect("get static");
        assert!(!got.is_empty(), "no match for static query");
        assert!(got.contains(&msg.to_vec()));
    }
}

#[test]
fn test_crash_recovery_replays_log() {
    let dir = TempDir::new().expect("temp dir");
    let n = 50usize;
    {
        let db = Db::open(dir.path(), Options::new()).expect("open");
        for i in 0..n {
            db.put(&b"unit6.test"[..], payload(i)).expect("put");
        }
        // Simulate a crash: no close, no sync. The leaked handle pins the
        // old lock file, so drop it to let the reopen take the directory.
        std::mem::forget(db);
        std::fs::remove_file(dir.path().join("LOCK")).expect("drop stale lock");
    }

    let db = Db::open(dir.path(), Options::new().with_mutable()).expect("reopen");
    // Replay made the entries queryable again.
    let got = db
        .get(&Query::new(&b"unit6.test"[..]).with_limit(n))
        .expect("get");
    assert_eq!(got, reversed(n));

    db.recover_log().expect("recover log");
    assert_eq!(db.count(), n as u64);

    // A further sync introduces no duplicates.
    db.sync().expect("sync");
    let got = db
        .get(&Query::new(&b"unit6.test"[..]).with_limit(2 * n))
        .expect("get after sync");
    assert_eq!(got, reversed(n));
}

#[test]
fn test_sync_twice_is_noop() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(dir.path(), Options::new()).expect("open");
    db.put(&b"unit.sync"[..], &b"v"[..]).expect("put");

    db.sync().expect("sync");
    let syncs = db.varz().expect("varz").syncs;
    db.sync().expect("second sync");
    assert_eq!(db.varz().expect("varz").syncs, syncs);
}

struct XorCipher(u8);

impl Cipher for XorCipher {
    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ self.0).collect()
    }

    fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ self.0).collect()
    }
}

#[test]
fn test_encryption_seam() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(
        dir.path(),
        Options::new().with_encryption(Arc::new(XorCipher(0x5a))),
    )
    .expect("open");

    let secret = b"attack at dawn".to_vec();
    db.put(&b"unit.secret"[..], secret.clone()).expect("put");
    db.sync().expect("sync");

    let got = db
        .get(&Query::new(&b"unit.secret"[..]).with_limit(1))
        .expect("get");
    assert_eq!(got, vec![secret.clone()]);

    // The stored bytes are not the plaintext.
    let raw = std::fs::read(dir.path().join("data")).expect("read data file");
    assert!(!raw
        .windows(secret.len())
        .any(|window| window == secret.as_slice()));
}

#[test]
fn test_items_iterator() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(dir.path(), Options::new()).expect("open");

    for i in 0..10 {
        db.put(&b"unit.items"[..], payload(i)).expect("put");
    }
    db.sync().expect("sync");

    let items: Result<Vec<_>, Error> = db.items().collect();
    let items = items.expect("items");
    assert_eq!(items.len(), 10);
    for item in &items {
        assert_eq!(item.topic, b"unit.items");
    }
    let mut values: Vec<_> = items.into_iter().map(|i| i.value).collect();
    values.sort();
    let mut expected: Vec<_> = (0..10).map(payload).collect();
    expected.sort();
    assert_eq!(values, expected);
}

#[test]
fn test_exclusive_directory_access() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(dir.path(), Options::new()).expect("open");

    let second = Db::open(dir.path(), Options::new());
    assert!(second.is_err(), "second open of the same directory succeeded");

    db.put(&b"unit.lock"[..], &b"v"[..]).expect("put");
    db.close().expect("close");
    drop(db);

    let db = Db::open(dir.path(), Options::new()).expect("open after close");
    let got = db
        .get(&Query::new(&b"unit.lock"[..]).with_limit(1))
        .expect("get");
    assert_eq!(got, vec![b"v".to_vec()]);
}

#[test]
fn test_delete_requires_mutable() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(dir.path(), Options::new()).expect("open");
    let id = db.new_id();
    db.put_entry(Entry::new(&b"unit.ro"[..], &b"v"[..]).with_id(id.clone()))
        .expect("put");
    assert_eq!(db.delete(&id, b"unit.ro"), Err(Error::ReadOnly));
}

#[tokio::test]
async fn test_background_sync_applies_log() {
    let dir = TempDir::new().expect("temp dir");
    let db = Db::open(
        dir.path(),
        Options::new().with_workers(
            unitdb::WorkerOptions::default().sync_interval(std::time::Duration::from_millis(20)),
        ),
    )
    .expect("open");

    for i in 0..25 {
        db.put(&b"unit.bg"[..], payload(i)).expect("put");
    }

    // The sync worker commits without an explicit sync call.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while db.count() != 25 && std::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(db.count(), 25);

    let got = db
        .get(&Query::new(&b"unit.bg"[..]).with_limit(25))
        .expect("get");
    assert_eq!(got, reversed(25));
}
