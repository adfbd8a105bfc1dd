use byteorder::{ByteOrder, LittleEndian};

use crate::errinput;
use crate::error::Result;

use super::header::{LogInfo, LogStatus};
use super::Wal;

/// One-shot writer staging the frames of a single log. Frames accumulate in
/// a pooled buffer; `sign_init_write` commits them to the segment as one
/// durable log and consumes the writer.
pub struct LogWriter<'a> {
    wal: &'a Wal,
    buffer: Vec<u8>,
    count: u32,
}

impl<'a> LogWriter<'a> {
    pub(super) fn new(wal: &'a Wal, buffer: Vec<u8>) -> Self {
        Self {
            wal,
            buffer,
            count: 0,
        }
    }

    /// Stages one record. The frame length prefix includes its own four
    /// bytes.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.count += 1;
        let mut scratch = [0u8; 4];
        LittleEndian::write_u32(&mut scratch, data.len() as u32 + 4);
        self.buffer.extend_from_slice(&scratch);
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Commits the staged frames as one log stamped with `time_id` and
    /// flagged written. An empty writer commits nothing.
    pub fn sign_init_write(mut self, time_id: u64) -> Result<()> {
        let buffer = std::mem::take(&mut self.buffer);
        if buffer.is_empty() {
            self.wal.release_buffer(buffer);
            return Ok(());
        }
        if time_id == 0 {
            self.wal.release_buffer(buffer);
            return errinput!("log commit requires a non-zero time id");
        }

        let info = LogInfo {
            status: LogStatus::Written,
            entry_count: self.count,
            seq: time_id,
            size: buffer.len() as i64,
            ..LogInfo::default()
        };
        let result = self.wal.put(info, &buffer);
        self.wal.release_buffer(buffer);
        result
    }
}
