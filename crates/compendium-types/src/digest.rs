use std::fmt;

use serde::{Deserialize, Serialize};

/// Content hashing algorithms usable for a [`Digest`].
///
/// `Sha256` is the only algorithm implemented today; the enum is kept open
/// so a future algorithm can be added without changing the tagged-multihash
/// wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Sha256,
}

impl Algorithm {
    pub fn tag(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha2-256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest string has no recognized algorithm tag: {0}")]
    UnknownTag(String),
    #[error("digest string is missing its hex payload: {0}")]
    MissingPayload(String),
}

/// A tagged multihash: `{algorithm-code}{length}{hex}`, e.g.
/// `sha2-256:32:9f86d0...`. The length field is the digest length in bytes,
/// which lets consumers route to the right algorithm without guessing from
/// hex string length alone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn new(algorithm: Algorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            hex: hex::encode(bytes),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    fn byte_len(&self) -> usize {
        self.hex.len() / 2
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.algorithm.tag(), self.byte_len(), self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl std::str::FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let tag = parts.next().unwrap_or_default();
        let algorithm = match tag {
            "sha2-256" => Algorithm::Sha256,
            _ => return Err(DigestParseError::UnknownTag(s.to_string())),
        };
        // length field is informational; we don't re-derive it, just skip it.
        let _length = parts.next();
        let hex = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DigestParseError::MissingPayload(s.to_string()))?;
        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let digest = Digest::new(Algorithm::Sha256, &[0x9f, 0x86, 0xd0]);
        let rendered = digest.to_string();
        assert_eq!(rendered, "sha2-256:3:9f86d0");
        let parsed: Digest = rendered.parse().unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn rejects_unknown_algorithm_tag() {
        let err = "blake3:32:abcd".parse::<Digest>().unwrap_err();
        assert_eq!(err, DigestParseError::UnknownTag("blake3:32:abcd".into()));
    }
}
