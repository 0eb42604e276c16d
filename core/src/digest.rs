//! Content digests in `<algorithm>:<hex>` form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Result, StratumError};

/// The only algorithm stratum produces.
pub const SHA256: &str = "sha256";

/// A content digest, e.g. `sha256:2cf24d...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_sha256(hasher)
    }

    /// Finish a running SHA256 hasher into a digest.
    pub fn from_sha256(hasher: Sha256) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Build a digest from a bare sha256 hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        validate_hex(hex_str)?;
        Ok(Self {
            algorithm: SHA256.to_string(),
            hex: hex_str.to_ascii_lowercase(),
        })
    }

    /// Parse `<algorithm>:<hex>`.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex_part) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| StratumError::Other(format!("invalid digest '{}': missing ':'", s)))?;

        if algorithm != SHA256 {
            return Err(StratumError::Other(format!(
                "unsupported digest algorithm '{}'",
                algorithm
            )));
        }
        Self::from_hex(hex_part)
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Hex encoding, used to key directories and files on disk.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First 12 hex characters, for log output.
    pub fn short(&self) -> &str {
        &self.hex[..12.min(self.hex.len())]
    }
}

fn validate_hex(hex_str: &str) -> Result<()> {
    if hex_str.len() != 64 || !hex_str.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StratumError::Other(format!(
            "invalid sha256 hex '{}'",
            hex_str
        )));
    }
    Ok(())
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = StratumError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}
