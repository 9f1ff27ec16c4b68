//! Snapshot digests
//!
//! A snapshot digest is the base64-encoded MD5 of the archive bytes, the
//! same value S3 accepts as `Content-MD5`.

use std::io::{self, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};

/// Base64 MD5 of `data`
pub fn content_md5(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

/// Incremental digest over a byte stream
#[derive(Default, Clone)]
pub struct DigestAccumulator {
    hasher: Md5,
}

impl DigestAccumulator {
    /// Start an empty digest
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Base64 digest of everything fed so far
    pub fn finish(self) -> String {
        STANDARD.encode(self.hasher.finalize())
    }
}

/// Writer that digests every byte it passes through to `inner`.
///
/// Wrapping the archive file in this guarantees the digest covers exactly
/// the bytes that are later uploaded.
pub struct HashingWriter<W> {
    inner: W,
    digest: DigestAccumulator,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap `inner`
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digest: DigestAccumulator::new(),
        }
    }

    /// Return the inner writer and the digest of everything written
    pub fn finish(self) -> (W, String) {
        (self.inner, self.digest.finish())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn test_writer_digest_matches_direct_digest() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (bytes, digest) = w.finish();
        assert_eq!(bytes, b"hello world");
        assert_eq!(digest, content_md5(b"hello world"));
    }

    #[test]
    fn test_accumulator_is_incremental() {
        let mut acc = DigestAccumulator::new();
        acc.update(b"abc");
        acc.update(b"def");
        assert_eq!(acc.finish(), content_md5(b"abcdef"));
    }
}
