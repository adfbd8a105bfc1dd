use std::sync::Arc;
use std::time::Duration;

use crate::cipher::Cipher;

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Capacity of pooled scratch buffers used by the log and sync writers
    /// (default: 1MB).
    pub buffer_size: usize,

    /// Target size of the in-memory staging store before shrinking
    /// (default: 32MB).
    pub memdb_size: i64,

    /// Smallest freed data-file range worth tracking for reuse
    /// (default: 64).
    pub free_block_size: u32,

    /// Permit deletes (default: false).
    pub mutable: bool,

    /// Run the background TTL expiry worker (default: false).
    pub background_key_expiry: bool,

    /// Payload cipher; entries are stored exactly as `encrypt` returns
    /// them (default: none).
    pub encryption: Option<Arc<dyn Cipher>>,

    /// Background worker configuration.
    pub workers: WorkerOptions,
}

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// How often the sync worker drains the staging store to disk
    /// (default: 1s).
    pub sync_interval: Duration,

    /// How often the drain worker considers shrinking the staging store
    /// (default: 1s).
    pub drain_interval: Duration,

    /// How often the expiry worker removes entries past their TTL
    /// (default: 1m).
    pub expiry_interval: Duration,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("buffer_size", &self.buffer_size)
            .field("memdb_size", &self.memdb_size)
            .field("free_block_size", &self.free_block_size)
            .field("mutable", &self.mutable)
            .field("background_key_expiry", &self.background_key_expiry)
            .field("encryption", &self.encryption.is_some())
            .field("workers", &self.workers)
            .finish()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_size: 1 << 20,
            memdb_size: 1 << 25,
            free_block_size: 1 << 6,
            mutable: false,
            background_key_expiry: false,
            encryption: None,
            workers: WorkerOptions::default(),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(1),
            drain_interval: Duration::from_secs(1),
            expiry_interval: Duration::from_secs(60),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_memdb_size(mut self, size: i64) -> Self {
        self.memdb_size = size;
        self
    }

    pub fn with_free_block_size(mut self, size: u32) -> Self {
        self.free_block_size = size;
        self
    }

    pub fn with_mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    pub fn with_background_key_expiry(mut self) -> Self {
        self.background_key_expiry = true;
        self
    }

    pub fn with_encryption(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.encryption = Some(cipher);
        self
    }

    pub fn with_workers(mut self, workers: WorkerOptions) -> Self {
        self.workers = workers;
        self
    }
}

impl WorkerOptions {
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn expiry_interval(mut self, interval: Duration) -> Self {
        self.expiry_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.buffer_size, 1 << 20);
        assert_eq!(opts.memdb_size, 1 << 25);
        assert_eq!(opts.free_block_size, 1 << 6);
        assert!(!opts.mutable);
        assert!(!opts.background_key_expiry);
        assert!(opts.encryption.is_none());
    }

    #[test]
    fn test_builder() {
        let opts = Options::new()
            .with_buffer_size(1 << 4)
            .with_memdb_size(1 << 16)
            .with_free_block_size(1 << 4)
            .with_mutable()
            .with_background_key_expiry()
            .with_workers(WorkerOptions::default().sync_interval(Duration::from_millis(100)));

        assert_eq!(opts.buffer_size, 1 << 4);
        assert_eq!(opts.memdb_size, 1 << 16);
        assert_eq!(opts.free_block_size, 1 << 4);
        assert!(opts.mutable);
        assert!(opts.background_key_expiry);
        assert_eq!(opts.workers.sync_interval, Duration::from_millis(100));
    }
}
