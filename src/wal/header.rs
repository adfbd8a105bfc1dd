use byteorder::{ByteOrder, LittleEndian};

use crate::errdata;
use crate::error::Result;

pub const WAL_HEADER_SIZE: usize = 70;
pub const LOG_INFO_SIZE: usize = 32;

const SIGNATURE: [u8; 8] = *b"tracedb\xfd";
const VERSION: u32 = 1;

pub const LOG_VERSION: u16 = 1;

/// A reusable byte range inside the segment, freed by applying a log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeBlock {
    pub size: i64,
    pub offset: i64,
}

/// Signed segment header. Tracks the highest sequence the segment has seen
/// and up to three free ranges available for log reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub signature: [u8; 8],
    pub version: u32,
    pub seq: u64,
    pub free_blocks: [FreeBlock; 3],
}

impl Default for Header {
    fn default() -> Self {
        Self {
            signature: SIGNATURE,
            version: VERSION,
            seq: 0,
            free_blocks: [FreeBlock::default(); 3],
        }
    }
}

impl Header {
    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.signature);
        LittleEndian::write_u32(&mut buf[8..12], self.version);
        LittleEndian::write_u64(&mut buf[12..20], self.seq);
        let mut off = 20;
        for fb in &self.free_blocks {
            LittleEndian::write_i64(&mut buf[off..off + 8], fb.size);
            LittleEndian::write_i64(&mut buf[off + 8..off + 16], fb.offset);
            off += 16;
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WAL_HEADER_SIZE {
            return errdata!("log header too short: {} bytes", buf.len());
        }
        let mut header = Header {
            signature: [0u8; 8],
            version: LittleEndian::read_u32(&buf[8..12]),
            seq: LittleEndian::read_u64(&buf[12..20]),
            free_blocks: [FreeBlock::default(); 3],
        };
        header.signature.copy_from_slice(&buf[0..8]);
        let mut off = 20;
        for fb in header.free_blocks.iter_mut() {
            fb.size = LittleEndian::read_i64(&buf[off..off + 8]);
            fb.offset = LittleEndian::read_i64(&buf[off + 8..off + 16]);
            off += 16;
        }
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        if self.signature != SIGNATURE {
            return errdata!("bad log signature");
        }
        if self.version != VERSION {
            return errdata!("unsupported log version {}", self.version);
        }
        Ok(())
    }
}

/// Lifecycle of one log within a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStatus {
    New,
    Written,
    Applied,
}

impl LogStatus {
    fn from_u16(v: u16) -> Result<Self> {
        match v {
            0 => Ok(LogStatus::New),
            1 => Ok(LogStatus::Written),
            2 => Ok(LogStatus::Applied),
            _ => errdata!("unknown log status {v}"),
        }
    }

    fn as_u16(self) -> u16 {
        match self {
            LogStatus::New => 0,
            LogStatus::Written => 1,
            LogStatus::Applied => 2,
        }
    }
}

/// Per-log record preceding the packed frames of one committed write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogInfo {
    pub version: u16,
    pub status: LogStatus,
    pub entry_count: u32,
    pub seq: u64,
    pub size: i64,
    pub offset: i64,
}

impl Default for LogInfo {
    fn default() -> Self {
        Self {
            version: LOG_VERSION,
            status: LogStatus::New,
            entry_count: 0,
            seq: 0,
            size: 0,
            offset: 0,
        }
    }
}

impl LogInfo {
    pub fn encode(&self) -> [u8; LOG_INFO_SIZE] {
        let mut buf = [0u8; LOG_INFO_SIZE];
        LittleEndian::write_u16(&mut buf[0..2], self.version);
        LittleEndian::write_u16(&mut buf[2..4], self.status.as_u16());
        LittleEndian::write_u32(&mut buf[4..8], self.entry_count);
        LittleEndian::write_u64(&mut buf[8..16], self.seq);
        LittleEndian::write_i64(&mut buf[16..24], self.size);
        LittleEndian::write_i64(&mut buf[24..32], self.offset);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LOG_INFO_SIZE {
            return errdata!("log info too short: {} bytes", buf.len());
        }
        Ok(Self {
            version: LittleEndian::read_u16(&buf[0..2]),
            status: LogStatus::from_u16(LittleEndian::read_u16(&buf[2..4]))?,
            entry_count: LittleEndian::read_u32(&buf[4..8]),
            seq: LittleEndian::read_u64(&buf[8..16]),
            size: LittleEndian::read_i64(&buf[16..24]),
            offset: LittleEndian::read_i64(&buf[24..32]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = Header::default();
        header.seq = 42;
        header.free_blocks[0] = FreeBlock { size: 128, offset: 70 };
        header.free_blocks[2] = FreeBlock { size: 64, offset: 512 };

        let buf = header.encode();
        assert_eq!(buf.len(), WAL_HEADER_SIZE);
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_validation() {
        let mut buf = Header::default().encode();
        buf[0..8].copy_from_slice(b"INVALID!");
        assert!(Header::decode(&buf).is_err());

        let mut buf = Header::default().encode();
        LittleEndian::write_u32(&mut buf[8..12], 999);
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn test_log_info_roundtrip() {
        let info = LogInfo {
            version: LOG_VERSION,
            status: LogStatus::Written,
            entry_count: 3,
            seq: 77,
            size: 4096,
            offset: 70,
        };
        let buf = info.encode();
        assert_eq!(buf.len(), LOG_INFO_SIZE);
        assert_eq!(LogInfo::decode(&buf).unwrap(), info);
    }

    #[test]
    fn test_log_info_rejects_unknown_status() {
        let mut buf = LogInfo::default().encode();
        LittleEndian::write_u16(&mut buf[2..4], 9);
        assert!(LogInfo::decode(&buf).is_err());
    }
}
