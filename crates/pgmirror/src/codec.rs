//! Text codecs for drivers that hand over notification payloads as bytes
//!
//! `PostgresDriver` is not one of them: `tokio-postgres` runs with a UTF-8
//! client encoding and delivers payloads as text, which no codec touches.

/// Turns payload bytes in the server's encoding into a Rust string
pub trait TextCodec: Send + Sync {
    fn name(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> String;
}

/// ISO-8859-1: every byte maps to the code point of the same value
#[derive(Debug, Clone, Copy, Default)]
pub struct Latin1;

impl TextCodec for Latin1 {
    fn name(&self) -> &str {
        "ISO-8859-1"
    }

    fn decode(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| b as char).collect()
    }
}
