// src/integrity.rs

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer used for every hashing pass.
pub const BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("hash algorithm unavailable: {0}")]
    HashUnavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Digest used to check artifacts against the server-published checksum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Length of the lowercase hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 32,
            ChecksumAlgorithm::Sha256 => 64,
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(IntegrityError::HashUnavailable(other.to_string())),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => f.write_str("md5"),
            ChecksumAlgorithm::Sha256 => f.write_str("sha256"),
        }
    }
}

enum DigestState {
    Md5(Md5),
    Sha256(Sha256),
}

/// Incremental digest over a byte stream.
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    state: DigestState,
    consumed: u64,
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checksum")
            .field("algorithm", &self.algorithm)
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let state = match algorithm {
            ChecksumAlgorithm::Md5 => DigestState::Md5(Md5::new()),
            ChecksumAlgorithm::Sha256 => DigestState::Sha256(Sha256::new()),
        };
        Self {
            algorithm,
            state,
            consumed: 0,
        }
    }

    /// Number of bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.state {
            DigestState::Md5(h) => h.update(bytes),
            DigestState::Sha256(h) => h.update(bytes),
        }
        self.consumed += bytes.len() as u64;
    }

    /// Consume the state and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self.state {
            DigestState::Md5(h) => hex::encode(h.finalize()),
            DigestState::Sha256(h) => hex::encode(h.finalize()),
        }
    }

    /// Feed the next `len` bytes of `reader` into the digest.
    /// Fails with `UnexpectedEof` if the reader ends early.
    pub async fn update_from_reader<R>(&mut self, reader: &mut R, len: u64) -> Result<(), IntegrityError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(BUFFER_SIZE as u64) as usize;
            let n = reader.read(&mut buffer[..want]).await?;
            if n == 0 {
                return Err(IntegrityError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("source ended with {remaining} bytes left to hash"),
                )));
            }
            self.update(&buffer[..n]);
            remaining -= n as u64;
        }
        Ok(())
    }
}

/// Hash everything `reader` yields until EOF.
pub async fn hash_reader<R>(algorithm: ChecksumAlgorithm, mut reader: R) -> Result<String, IntegrityError>
where
    R: AsyncRead + Unpin,
{
    let mut checksum = Checksum::new(algorithm);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        checksum.update(&buffer[..n]);
    }
    Ok(checksum.finalize_hex())
}

/// Hash a complete file.
pub async fn hash_file(algorithm: ChecksumAlgorithm, path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    hash_reader(algorithm, file).await
}

/// Rebuild a digest over the first `len` bytes of a partial file.
pub async fn hash_prefix(algorithm: ChecksumAlgorithm, path: &Path, len: u64) -> Result<Checksum, IntegrityError> {
    let mut checksum = Checksum::new(algorithm);
    if len > 0 {
        let mut file = File::open(path).await?;
        checksum.update_from_reader(&mut file, len).await?;
    }
    Ok(checksum)
}

/// Hex digests compare case-insensitively.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_MD5: &str = "b1946ac92492d2347c6235b4d2611184";
    const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[tokio::test]
    async fn hashes_known_content() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello\n").unwrap();
        f.flush().unwrap();

        assert_eq!(hash_file(ChecksumAlgorithm::Md5, f.path()).await.unwrap(), HELLO_MD5);
        assert_eq!(hash_file(ChecksumAlgorithm::Sha256, f.path()).await.unwrap(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn empty_source() {
        let digest = hash_reader(ChecksumAlgorithm::Md5, &b""[..]).await.unwrap();
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut c = Checksum::new(ChecksumAlgorithm::Md5);
        c.update(b"hel");
        c.update(b"lo\n");
        assert_eq!(c.consumed(), 6);
        assert_eq!(c.finalize_hex(), HELLO_MD5);
    }

    #[tokio::test]
    async fn prefix_then_stream_matches_full_hash() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello\n").unwrap();
        f.flush().unwrap();

        let mut c = hash_prefix(ChecksumAlgorithm::Sha256, f.path(), 3).await.unwrap();
        c.update(b"lo\n");
        assert_eq!(c.finalize_hex(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn prefix_longer_than_file_is_an_io_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        f.flush().unwrap();

        let err = hash_prefix(ChecksumAlgorithm::Md5, f.path(), 10).await.unwrap_err();
        assert!(matches!(err, IntegrityError::Io(_)));
    }

    #[test]
    fn unknown_algorithm_is_unavailable() {
        assert_eq!("MD5".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Md5);
        assert_eq!("sha-256".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Sha256);
        assert!(matches!(
            "crc32".parse::<ChecksumAlgorithm>(),
            Err(IntegrityError::HashUnavailable(_))
        ));
    }

    #[test]
    fn digest_comparison_ignores_case() {
        assert!(digests_match("ABCDEF", "abcdef"));
        assert!(!digests_match("abcdef", "abcdee"));
    }
}
