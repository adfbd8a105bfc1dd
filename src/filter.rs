use bloomfilter::Bloom;
use byteorder::{ByteOrder, LittleEndian};

use crate::errdata;
use crate::error::Result;
use crate::fio::Fio;

const FILTER_VERSION: u8 = 1;
const EXPECTED_ITEMS: usize = 1 << 20;
const FALSE_POSITIVE_RATE: f64 = 0.01;

// version + items + num_bits + num_hashes + two sip key pairs
const FILTER_HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 32;

/// Probabilistic presence check over committed sequences, persisted as a
/// bitmap in the filter file. A negative test means the sequence was never
/// committed, which lets the delete and expiry paths skip index walks.
pub struct Filter {
    bloom: Bloom<[u8]>,
    items: u64,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter").field("items", &self.items).finish()
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter {
    pub fn new() -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(EXPECTED_ITEMS, FALSE_POSITIVE_RATE),
            items: 0,
        }
    }

    pub fn append(&mut self, seq: u64) {
        self.bloom.set(&seq.to_le_bytes()[..]);
        self.items += 1;
    }

    /// False means the sequence is definitely absent; true means it might
    /// be present.
    pub fn test(&self, seq: u64) -> bool {
        self.bloom.check(&seq.to_le_bytes()[..])
    }

    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let bitmap = self.bloom.bitmap();
        let sip_keys = self.bloom.sip_keys();
        let mut buf = vec![0u8; FILTER_HEADER_SIZE + bitmap.len()];
        buf[0] = FILTER_VERSION;
        LittleEndian::write_u64(&mut buf[1..9], self.items);
        LittleEndian::write_u64(&mut buf[9..17], self.bloom.number_of_bits());
        LittleEndian::write_u32(&mut buf[17..21], self.bloom.number_of_hash_functions());
        LittleEndian::write_u64(&mut buf[21..29], sip_keys[0].0);
        LittleEndian::write_u64(&mut buf[29..37], sip_keys[0].1);
        LittleEndian::write_u64(&mut buf[37..45], sip_keys[1].0);
        LittleEndian::write_u64(&mut buf[45..53], sip_keys[1].1);
        buf[FILTER_HEADER_SIZE..].copy_from_slice(&bitmap);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILTER_HEADER_SIZE {
            return errdata!("filter bitmap too short: {} bytes", buf.len());
        }
        if buf[0] != FILTER_VERSION {
            return errdata!("unsupported filter version {}", buf[0]);
        }
        let items = LittleEndian::read_u64(&buf[1..9]);
        let num_bits = LittleEndian::read_u64(&buf[9..17]);
        let num_hashes = LittleEndian::read_u32(&buf[17..21]);
        let sip_keys = [
            (
                LittleEndian::read_u64(&buf[21..29]),
                LittleEndian::read_u64(&buf[29..37]),
            ),
            (
                LittleEndian::read_u64(&buf[37..45]),
                LittleEndian::read_u64(&buf[45..53]),
            ),
        ];
        let bitmap = &buf[FILTER_HEADER_SIZE..];
        if bitmap.len() as u64 * 8 < num_bits {
            return errdata!("filter bitmap truncated");
        }
        Ok(Self {
            bloom: Bloom::from_existing(bitmap, num_bits, num_hashes, sip_keys),
            items,
        })
    }

    /// Loads the filter from its file; an empty file yields a fresh filter.
    pub fn load(fio: &Fio) -> Result<Self> {
        if fio.size() == 0 {
            return Ok(Self::new());
        }
        Self::from_bytes(&fio.slice(0, fio.size())?)
    }

    pub fn save(&self, fio: &Fio) -> Result<()> {
        fio.truncate(0)?;
        fio.write_at(&self.to_bytes(), 0)?;
        fio.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_membership() {
        let mut filter = Filter::new();
        for seq in 1..100u64 {
            filter.append(seq);
        }
        for seq in 1..100u64 {
            assert!(filter.test(seq));
        }
        let misses = (10_000..10_100u64).filter(|&s| filter.test(s)).count();
        assert!(misses < 10, "{misses} false positives out of 100");
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut filter = Filter::new();
        filter.append(7);
        filter.append(42);

        let restored = Filter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(restored.items(), 2);
        assert!(restored.test(7));
        assert!(restored.test(42));

        assert!(Filter::from_bytes(&[9u8; 8]).is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let fio = Fio::open(dir.path().join("filter")).unwrap();

        // An empty file is a fresh filter.
        let mut filter = Filter::load(&fio).unwrap();
        assert_eq!(filter.items(), 0);

        filter.append(99);
        filter.save(&fio).unwrap();

        let restored = Filter::load(&fio).unwrap();
        assert!(restored.test(99));
        assert_eq!(restored.items(), 1);
    }
}
