//! Content digests.
//!
//! A [`Digest`] is the `algorithm:hex` identifier used to address blobs and
//! manifests. Only the algorithms registered with the OCI image spec are
//! accepted, and the encoded part must be lowercase hex of the exact length
//! the algorithm produces.
//!
//! [`DigestHasher`] computes digests incrementally, which is how the blob store
//! and the upload sessions verify content while it streams past.

use core::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, StoreError};

/// Buffer size used when hashing files and streams.
pub(crate) const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A digest algorithm supported by the registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256, the canonical algorithm. Manifest digests always use it.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    /// The identifier used before the `:` in a digest string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Number of hex characters in an encoded digest of this algorithm.
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    /// Start an incremental hash with this algorithm.
    pub fn hasher(self) -> DigestHasher {
        match self {
            Self::Sha256 => DigestHasher::Sha256(Sha256::new()),
            Self::Sha512 => DigestHasher::Sha512(Sha512::new()),
        }
    }

    /// All algorithms, in the order directories are scanned.
    pub const ALL: [Algorithm; 2] = [Self::Sha256, Self::Sha512];
}

impl FromStr for Algorithm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(StoreError::DigestInvalid {
                digest: s.to_string(),
                reason: "unsupported algorithm",
            }),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `algorithm:hex` content identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parse a digest string such as `sha256:e3b0c442...`.
    pub fn parse(digest: &str) -> Result<Self> {
        let invalid = |reason| StoreError::DigestInvalid {
            digest: digest.to_string(),
            reason,
        };

        let (algorithm, hex) = digest
            .split_once(':')
            .ok_or_else(|| invalid("expected 'algorithm:hex'"))?;
        let algorithm = algorithm
            .parse::<Algorithm>()
            .map_err(|_| invalid("unsupported algorithm"))?;
        Self::from_hex(algorithm, hex).map_err(|_| invalid("bad encoded portion"))
    }

    /// Build a digest from an algorithm and its encoded portion.
    pub fn from_hex(algorithm: Algorithm, hex: &str) -> Result<Self> {
        if hex.len() != algorithm.hex_len() {
            return Err(StoreError::DigestInvalid {
                digest: format!("{algorithm}:{hex}"),
                reason: "wrong length",
            });
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(StoreError::DigestInvalid {
                digest: format!("{algorithm}:{hex}"),
                reason: "encoded portion must be lowercase hex",
            });
        }
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Compute the digest of `data` with the given algorithm.
    pub fn compute(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Compute the SHA-256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(Algorithm::Sha256, data)
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex encoded portion.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Relative storage path: `algorithm/xx/xxyyyy...`.
    ///
    /// The two-character fan-out directory keeps directories small, the same
    /// way an object store splits by first byte.
    pub fn to_object_pathname(&self) -> String {
        format!("{}/{}/{}", self.algorithm, &self.hex[..2], self.hex)
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental digest computation.
#[derive(Debug, Clone)]
pub enum DigestHasher {
    /// SHA-256 state.
    Sha256(Sha256),
    /// SHA-512 state.
    Sha512(Sha512),
}

impl DigestHasher {
    /// The algorithm this hasher produces.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Sha256(_) => Algorithm::Sha256,
            Self::Sha512(_) => Algorithm::Sha512,
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Consume the hasher and produce the digest.
    pub fn finalize(self) -> Digest {
        let (algorithm, hex) = match self {
            Self::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            Self::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, hex }
    }
}

/// Hash an async reader to its end, returning the digest and byte count.
pub async fn digest_reader(
    algorithm: Algorithm,
    reader: &mut (impl AsyncRead + Unpin),
) -> std::io::Result<(Digest, u64)> {
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize(), total))
}
