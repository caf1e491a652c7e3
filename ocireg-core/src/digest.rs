//! Canonical `sha256:<hex>` digests and a streaming hasher to compute them.
//!
//! Comparison is case-sensitive on the hex portion: callers must normalize to
//! lowercase before constructing a [`Digest`], which is what [`Digest::from_str`]
//! enforces.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad digest")]
    Bad,
    #[error("unhandled digest algorithm: {0}")]
    UnhandledAlgorithm(String),
}

/// A `sha256:<64 lowercase hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Hashes `data` in one shot and returns its canonical digest.
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Self::from_sha256_bytes(&hasher.finalize())
    }

    fn from_sha256_bytes(bytes: &[u8]) -> Self {
        Self {
            hex: hex::encode(bytes),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        "sha256"
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (algo, hex_part) = s.split_once(':').ok_or(Error::Bad)?;
        if algo != "sha256" {
            return Err(Error::UnhandledAlgorithm(algo.to_string()));
        }
        if hex_part.len() != 64 || !is_lower_hex(hex_part) {
            return Err(Error::Bad);
        }
        Ok(Self {
            hex: hex_part.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.to_string()
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Incremental SHA-256 hasher used on the upload-append and CAR-pack paths so
/// callers never have to buffer bytes twice just to hash them.
pub struct DigestHasher(Sha256);

impl DigestHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, chunk: impl AsRef<[u8]>) {
        self.0.update(chunk.as_ref());
    }

    pub fn finalize(self) -> Digest {
        Digest::from_sha256_bytes(&self.0.finalize())
    }

    /// Checks without allocating a second hex string: walks the finalized
    /// digest bytes nibble by nibble against `expected`'s hex text.
    pub fn finalize_and_matches(self, expected: &Digest) -> bool {
        let bytes = self.0.finalize();
        digest_eq(&expected.hex, &bytes)
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn digest_eq(lower_hex: &str, bytes: &[u8]) -> bool {
    if lower_hex.len() != 2 * bytes.len() {
        return false;
    }
    #[rustfmt::skip]
    const LUT: [u8; 16] = [
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
        97, 98, 99, 100, 101, 102,
    ];
    let pairs = lower_hex.as_bytes().chunks_exact(2);
    pairs.zip(bytes).all(|(pair, byte)| {
        LUT[(byte >> 4) as usize] == pair[0] && LUT[(byte & 0xf) as usize] == pair[1]
    })
}
