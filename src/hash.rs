//! # Content Hashing
//!
//! Uses SHA3-384 for archive-entry integrity. Every payload entry written
//! into a snapshot container is tee'd through a streaming hasher and byte
//! counter so `Save` can populate `Snapshot::hashes`/`Snapshot::size`
//! without buffering the entry in memory, and so `Check`/`Open` can
//! recompute the same digest to detect corruption.

use sha3::{Digest, Sha3_384};
use std::io::{self, Read, Write};

/// Size of the read/copy buffer for streaming hash computation (64 KiB).
const BUF_SIZE: usize = 64 * 1024;

/// Computes the SHA3-384 digest of in-memory data, returning a hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha3_384::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// A `Read` wrapper that tees every byte through a running SHA3-384 hasher
/// and byte counter as it passes through. Used to compute `hashes[entry]`
/// and accumulate `size` while streaming a payload entry into the ZIP
/// writer, without holding the whole entry in memory.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha3_384,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha3_384::new(),
            count: 0,
        }
    }

    /// Bytes read so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Consumes the reader, returning the hex digest and total byte count.
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.count)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.count += n as u64;
        }
        Ok(n)
    }
}

/// Streams every byte of `reader` into the void while hashing/counting it,
/// returning the digest and size. Used by `Check`, which only needs to
/// verify integrity and has no destination to write the bytes to.
pub fn hash_stream<R: Read>(reader: R) -> io::Result<(String, u64)> {
    let mut tee = HashingReader::new(reader);
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = tee.read(&mut buf)?;
        if n == 0 {
            break;
        }
    }
    Ok(tee.finish())
}

/// Copies every byte from `reader` to `writer` while hashing/counting it,
/// returning the digest and size. Used by `Save` to tee a tar stream into
/// the ZIP writer, and by `Restore` to tee a ZIP entry into the tar
/// subprocess's stdin.
pub fn hash_copy<R: Read, W: Write>(mut reader: R, mut writer: W) -> io::Result<(String, u64)> {
    let mut hasher = Sha3_384::new();
    let mut count = 0u64;
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        count += n as u64;
        writer.write_all(&buf[..n])?;
    }
    Ok((hex::encode(hasher.finalize()), count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_consistent() {
        let h1 = hash_bytes(b"test data");
        let h2 = hash_bytes(b"test data");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 96); // SHA3-384 -> 48 bytes -> 96 hex chars
    }

    #[test]
    fn hash_bytes_different_inputs() {
        let h1 = hash_bytes(b"data A");
        let h2 = hash_bytes(b"data B");
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_copy_matches_hash_bytes() {
        let data = b"some streamed content goes here";
        let mut out = Vec::new();
        let (digest, size) = hash_copy(&data[..], &mut out).unwrap();
        assert_eq!(digest, hash_bytes(data));
        assert_eq!(size, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn hash_stream_matches_hash_bytes() {
        let data = b"another chunk of test data";
        let (digest, size) = hash_stream(&data[..]).unwrap();
        assert_eq!(digest, hash_bytes(data));
        assert_eq!(size, data.len() as u64);
    }
}
