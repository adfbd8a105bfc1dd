use byteorder::{ByteOrder, LittleEndian};

use crate::clock;
use crate::errdata;
use crate::error::Result;
use crate::topic;

/// Size of the fixed on-disk entry record.
pub const ENTRY_SIZE: usize = 32;

/// Size of a message ID: `[seq u64][contract u32][random u32]`.
pub const ID_SIZE: usize = 16;

/// An entry to be stored into the database.
#[derive(Clone, Debug, Default)]
pub struct Entry {
    pub topic: Vec<u8>,
    pub payload: Vec<u8>,
    pub id: Option<Vec<u8>>,
    pub contract: u32,
    pub expires_at: u32,
}

impl Entry {
    /// Creates a new entry from the topic and payload.
    pub fn new(topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_contract(mut self, contract: u32) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the expiry from a relative duration such as `"1m"` or `"90"`
    /// (seconds).
    pub fn with_ttl(mut self, ttl: &str) -> Result<Self> {
        let d = topic::parse_duration(ttl)?;
        self.expires_at = (clock::unix() + d.as_secs() as i64) as u32;
        Ok(self)
    }
}

/// Fixed-size record describing one stored message in the index file. The
/// topic and value bytes live in the data file at `msg_offset`; a negative
/// offset tombstones the record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub seq: u64,
    pub msg_offset: i64,
    pub topic_size: u16,
    pub value_size: u32,
    pub expires_at: u32,
    pub contract: u32,
}

impl IndexEntry {
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.seq);
        LittleEndian::write_i64(&mut buf[8..16], self.msg_offset);
        LittleEndian::write_u16(&mut buf[16..18], self.topic_size);
        LittleEndian::write_u32(&mut buf[18..22], self.value_size);
        LittleEndian::write_u32(&mut buf[22..26], self.expires_at);
        LittleEndian::write_u32(&mut buf[26..30], self.contract);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ENTRY_SIZE {
            return errdata!("entry record too short: {} bytes", buf.len());
        }
        Ok(Self {
            seq: LittleEndian::read_u64(&buf[0..8]),
            msg_offset: LittleEndian::read_i64(&buf[8..16]),
            topic_size: LittleEndian::read_u16(&buf[16..18]),
            value_size: LittleEndian::read_u32(&buf[18..22]),
            expires_at: LittleEndian::read_u32(&buf[22..26]),
            contract: LittleEndian::read_u32(&buf[26..30]),
        })
    }

    pub fn message_size(&self) -> usize {
        self.topic_size as usize + self.value_size as usize
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at != 0 && self.expires_at <= clock::unix32()
    }

    pub fn is_deleted(&self) -> bool {
        self.msg_offset < 0
    }
}

/// Builds a message ID embedding the entry's sequence and contract.
pub fn make_id(seq: u64, contract: u32) -> Vec<u8> {
    let mut id = vec![0u8; ID_SIZE];
    LittleEndian::write_u64(&mut id[0..8], seq);
    LittleEndian::write_u32(&mut id[8..12], contract);
    LittleEndian::write_u32(&mut id[12..16], rand::random());
    id
}

/// Recovers the sequence embedded in a message ID.
pub fn seq_from_id(id: &[u8]) -> Result<u64> {
    if id.len() != ID_SIZE {
        return errdata!("message id must be {ID_SIZE} bytes, got {}", id.len());
    }
    Ok(LittleEndian::read_u64(&id[0..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builder() {
        let e = Entry::new(&b"unit1.test"[..], &b"payload"[..])
            .with_contract(7)
            .with_ttl("1m")
            .unwrap();
        assert_eq!(e.topic, b"unit1.test");
        assert_eq!(e.payload, b"payload");
        assert_eq!(e.contract, 7);
        assert!(e.expires_at > clock::unix32());
    }

    #[test]
    fn test_index_entry_roundtrip() {
        let e = IndexEntry {
            seq: 42,
            msg_offset: 8192,
            topic_size: 10,
            value_size: 256,
            expires_at: 1_600_000_000,
            contract: 0xdead_beef,
        };
        let buf = e.encode();
        assert_eq!(IndexEntry::decode(&buf).unwrap(), e);
        assert!(IndexEntry::decode(&buf[..16]).is_err());
    }

    #[test]
    fn test_tombstone() {
        let e = IndexEntry {
            msg_offset: -1,
            ..Default::default()
        };
        assert!(e.is_deleted());
    }

    #[test]
    fn test_id_roundtrip() {
        let id = make_id(99, 7);
        assert_eq!(id.len(), ID_SIZE);
        assert_eq!(seq_from_id(&id).unwrap(), 99);
        assert!(seq_from_id(&id[..8]).is_err());
    }
}
