// src/hash.rs

//! Digests for artifact integrity
//!
//! Lockfiles spell hashes in several ways: pip uses `sha256:<hex>`, npm and
//! yarn use Subresource Integrity strings (`sha512-<base64>`), and yarn URLs
//! carry a bare sha1 fragment. Everything is normalized to [`Hash`], an
//! algorithm plus a lowercase hex value.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Get the hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Relative strength, used to pick one integrity value among several
    #[inline]
    pub const fn strength(&self) -> u8 {
        match self {
            Self::Md5 => 0,
            Self::Sha1 => 1,
            Self::Sha256 => 2,
            Self::Sha384 => 3,
            Self::Sha512 => 4,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha384" | "sha-384" => Ok(Self::Sha384),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Hash parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Unknown hash algorithm name
    UnknownAlgorithm(String),
    /// Hash string has wrong length for algorithm
    InvalidLength { expected: usize, got: usize },
    /// Hash string contains invalid hex characters
    InvalidHex(String),
    /// Not an `algo:hex` or SRI string
    InvalidFormat(String),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown hash algorithm: {}", name),
            Self::InvalidLength { expected, got } => {
                write!(f, "invalid hash length: expected {}, got {}", expected, got)
            }
            Self::InvalidHex(s) => write!(f, "invalid hex in hash: {}", s),
            Self::InvalidFormat(s) => write!(f, "invalid hash format: {}", s),
        }
    }
}

impl std::error::Error for HashError {}

impl From<HashError> for Error {
    fn from(e: HashError) -> Self {
        Error::ValidationError(e.to_string())
    }
}

/// A hash value with its algorithm
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash {
    /// The algorithm used
    pub algorithm: HashAlgorithm,
    /// The hash value as a lowercase hex string
    pub value: String,
}

impl Hash {
    /// Create a new hash value
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> std::result::Result<Self, HashError> {
        let value = value.into();
        let expected_len = algorithm.hex_len();

        if value.len() != expected_len {
            return Err(HashError::InvalidLength {
                expected: expected_len,
                got: value.len(),
            });
        }

        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex(value));
        }

        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }

    fn new_unchecked(algorithm: HashAlgorithm, value: String) -> Self {
        Self { algorithm, value }
    }

    /// Get the hash value as a hex string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Parse a prefixed hash string (`sha256:abc123...`)
    ///
    /// `algo=hex` is accepted too since that is how pip spells URL fragments.
    pub fn parse_prefixed(s: &str) -> std::result::Result<Self, HashError> {
        let (algo, hash) = s
            .split_once(':')
            .or_else(|| s.split_once('='))
            .ok_or_else(|| HashError::InvalidFormat(s.to_string()))?;
        Self::new(algo.parse()?, hash)
    }

    /// Parse a Subresource Integrity value (`sha512-<base64>`)
    pub fn from_integrity(s: &str) -> std::result::Result<Self, HashError> {
        let (algo, encoded) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| HashError::InvalidFormat(s.to_string()))?;
        let algorithm: HashAlgorithm = algo.parse()?;
        let raw = BASE64
            .decode(encoded)
            .map_err(|_| HashError::InvalidFormat(s.to_string()))?;
        Self::new(algorithm, hex::encode(raw))
    }

    /// Parse a space-separated SRI list and keep the strongest value
    pub fn strongest_integrity(s: &str) -> std::result::Result<Self, HashError> {
        let mut best: Option<Hash> = None;
        for part in s.split_whitespace() {
            let hash = Self::from_integrity(part)?;
            if best
                .as_ref()
                .is_none_or(|b| hash.algorithm.strength() > b.algorithm.strength())
            {
                best = Some(hash);
            }
        }
        best.ok_or_else(|| HashError::InvalidFormat(s.to_string()))
    }

    /// Format as a prefixed string (`sha256:abc123...`)
    pub fn to_prefixed_string(&self) -> String {
        format!("{}:{}", self.algorithm.name(), self.value)
    }

    /// Format as a Subresource Integrity value
    pub fn to_integrity(&self) -> String {
        // value is validated hex, decoding cannot fail for values built by this module
        let raw = hex::decode(&self.value).unwrap_or_default();
        format!("{}-{}", self.algorithm.name(), BASE64.encode(raw))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_prefixed_string())
    }
}

/// Hasher that can compute hashes using any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => HasherState::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { algorithm, state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha384(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
        }
    }

    /// Finalize and return the hash
    pub fn finalize(self) -> Hash {
        let value = match self.state {
            HasherState::Md5(h) => hex::encode(h.finalize()),
            HasherState::Sha1(h) => hex::encode(h.finalize()),
            HasherState::Sha256(h) => hex::encode(h.finalize()),
            HasherState::Sha384(h) => hex::encode(h.finalize()),
            HasherState::Sha512(h) => hex::encode(h.finalize()),
        };
        Hash::new_unchecked(self.algorithm, value)
    }
}

/// Compute hash of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Hash {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute hash of data from a reader
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<Hash> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute hash of a file, streaming its content
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<Hash> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", path.display())))?;
    Ok(hash_reader(algorithm, &mut file)?)
}

/// Verify a file against a list of candidate hashes
///
/// Succeeds as soon as any one candidate matches and returns that candidate.
/// An empty candidate list is accepted without reading the file.
pub fn verify_any(path: &Path, name: &str, candidates: &[Hash]) -> Result<Option<Hash>> {
    if candidates.is_empty() {
        return Ok(None);
    }

    let mut computed: Vec<Hash> = Vec::new();
    for candidate in candidates {
        let actual = match computed.iter().find(|h| h.algorithm == candidate.algorithm) {
            Some(h) => h.clone(),
            None => {
                let h = hash_file(candidate.algorithm, path)?;
                computed.push(h.clone());
                h
            }
        };
        if actual.value == candidate.value {
            return Ok(Some(candidate.clone()));
        }
    }

    let expected = candidates
        .iter()
        .map(Hash::to_prefixed_string)
        .collect::<Vec<_>>()
        .join(", ");
    let actual = computed
        .iter()
        .map(Hash::to_prefixed_string)
        .collect::<Vec<_>>()
        .join(", ");
    Err(Error::ChecksumMismatch {
        name: name.to_string(),
        expected,
        actual,
    })
}
