use std::fmt::Display;
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha512};

use crate::error::Error;

/// Hash algorithms a digest may use,
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Returns the textual name used in the `algo:hex` form and in blob paths,
    ///
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Expected length of the hex encoding for this algorithm,
    ///
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(Error::invalid_digest(format!(
                "unsupported algorithm {other}"
            ))),
        }
    }
}

/// Content digest, the canonical identifier of a byte sequence,
///
/// Compared by equality of the textual `algo:hex` form.
///
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parses the canonical `algo:hex` form,
    ///
    pub fn parse(s: impl AsRef<str>) -> Result<Self, Error> {
        let s = s.as_ref();
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid_digest(format!("missing algorithm in {s}")))?;

        let algorithm = Algorithm::from_str(algo)?;
        if hex.len() != algorithm.hex_len() {
            return Err(Error::invalid_digest(format!(
                "expected {} hex characters for {algorithm}, found {}",
                algorithm.hex_len(),
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(Error::invalid_digest(format!("non-hex characters in {s}")));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Computes a digest over a full byte sequence,
    ///
    pub fn from_bytes(algorithm: Algorithm, data: impl AsRef<[u8]>) -> Self {
        let mut digester = Digester::new(algorithm);
        digester.update(data.as_ref());
        digester.finalize()
    }

    /// Computes a digest with the canonical algorithm,
    ///
    pub fn canonical(data: impl AsRef<[u8]>) -> Self {
        Self::from_bytes(Algorithm::Sha256, data)
    }

    /// Returns the algorithm half,
    ///
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the hex half,
    ///
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Streaming digest computation, fed chunk by chunk as bytes move,
///
pub struct Digester {
    algorithm: Algorithm,
    hasher: Hasher,
}

impl Digester {
    /// Returns a new digester for the algorithm,
    ///
    pub fn new(algorithm: Algorithm) -> Self {
        let hasher = match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Digester { algorithm, hasher }
    }

    /// Returns a new digester for the canonical algorithm,
    ///
    pub fn canonical() -> Self {
        Self::new(Algorithm::Sha256)
    }

    /// Feeds bytes into the running hash,
    ///
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Consumes the digester and returns the digest of everything fed so far,
    ///
    pub fn finalize(self) -> Digest {
        let hex = match self.hasher {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        };
        Digest {
            algorithm: self.algorithm,
            hex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let d = Digest::canonical(b"hello world");
        assert_eq!(
            d.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let parsed = Digest::parse(d.to_string()).expect("should parse");
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Digest::parse("sha256").is_err());
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse("sha256:abcd").is_err());
        assert!(Digest::parse(format!("sha256:{}", "Z".repeat(64))).is_err());
        assert!(Digest::parse(format!("sha256:{}", "A".repeat(64))).is_err());
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut digester = Digester::new(Algorithm::Sha512);
        digester.update(b"hello ");
        digester.update(b"world");
        assert_eq!(
            digester.finalize(),
            Digest::from_bytes(Algorithm::Sha512, b"hello world")
        );
    }
}
