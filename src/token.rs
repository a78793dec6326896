//! API authentication token handling.
//!
//! The Evict API hands out opaque bearer tokens; the same token authorizes
//! both the REST lookups and the music WebSocket (`?auth=` query parameter).
//! Tokens are secrets: `Debug` output is redacted, and the secrets file is
//! size-checked before parsing.

use std::{fs, io, str::FromStr};

use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

/// Maximum size of the secrets file, in bytes.
///
/// Guards against reading arbitrarily large files into memory.
const SECRETS_FILE_MAX_SIZE: u64 = 16 * 1024;

/// Maximum accepted token length, in characters.
const TOKEN_MAX_LENGTH: usize = 2048;

/// An Evict API bearer token.
///
/// Validated on construction: non-empty, printable ASCII, bounded length.
#[derive(Clone, Eq, Hash, PartialEq, Redact)]
pub struct AuthToken {
    #[redact(fixed = 8)]
    token: String,
}

/// Secrets file contents.
#[derive(Debug, Deserialize)]
struct Secrets {
    token: String,
}

impl AuthToken {
    /// Loads the token from a TOML secrets file with a `token` key.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is larger than
    /// [`SECRETS_FILE_MAX_SIZE`], does not parse as TOML, or contains an
    /// invalid token.
    pub fn from_file(secrets_file: &str) -> Result<Self> {
        let attributes = fs::metadata(secrets_file)?;
        let file_size = attributes.len();
        if file_size > SECRETS_FILE_MAX_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{secrets_file} is too large ({file_size} bytes)"),
            )
            .into());
        }

        let contents = fs::read_to_string(secrets_file)?;
        let secrets: Secrets = toml::from_str(&contents)?;
        secrets.token.parse()
    }

    /// The token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl FromStr for AuthToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let count = s.chars().count();
        if count == 0 {
            return Err(Error::unauthenticated("token is empty"));
        }
        if count > TOKEN_MAX_LENGTH {
            return Err(Error::invalid_argument(format!(
                "token too long ({count} characters)"
            )));
        }
        if s.contains(|chr: char| chr.is_ascii_whitespace() || chr.is_control()) {
            return Err(Error::invalid_argument(
                "token contains whitespace or control characters",
            ));
        }

        Ok(Self {
            token: s.to_owned(),
        })
    }
}
