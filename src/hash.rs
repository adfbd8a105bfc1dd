use crc::{Crc, CRC_32_ISCSI, CRC_64_ECMA_182};

pub const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Virtual points per shard on the consistent ring.
const REPLICAS: u32 = 20;

/// Digest of a full topic path under a contract salt. Identifies one topic
/// across restarts, so it must stay stable for a given (contract, path).
pub fn topic_hash(contract: u32, path: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&contract.to_le_bytes());
    digest.update(path);
    digest.finalize()
}

/// Consistent mapping from 64-bit keys to shard indexes. Treated as a black
/// box by callers: the only property relied upon is that a given key always
/// lands on the same shard.
#[derive(Debug)]
pub struct Consistent {
    // (ring point, shard), sorted by point
    points: Vec<(u64, u32)>,
    shards: u32,
}

impl Consistent {
    pub fn new(shards: u32) -> Self {
        let mut points = Vec::with_capacity((shards * REPLICAS) as usize);
        for shard in 0..shards {
            for replica in 0..REPLICAS {
                let mut digest = CRC64.digest();
                digest.update(&shard.to_le_bytes());
                digest.update(&replica.to_le_bytes());
                points.push((digest.finalize(), shard));
            }
        }
        points.sort_unstable();
        points.dedup_by_key(|p| p.0);
        Self { points, shards }
    }

    pub fn shards(&self) -> u32 {
        self.shards
    }

    /// Returns the shard index owning the given key.
    pub fn find_block(&self, key: u64) -> usize {
        let h = CRC64.checksum(&key.to_le_bytes());
        let idx = self.points.partition_point(|&(point, _)| point < h);
        let (_, shard) = self.points[idx % self.points.len()];
        shard as usize
    }
}
