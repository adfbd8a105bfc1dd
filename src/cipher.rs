/// Payload encryption seam. Key management lives outside the engine; the
/// storage layer only ever calls this pair, and stores whatever
/// `encrypt` returns.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Vec<u8>;
    fn decrypt(&self, data: &[u8]) -> Vec<u8>;
}

/// Identity cipher used when no encryption is configured.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Cipher for Passthrough {
    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}
