//! Room codes and room passwords
//!
//! A room code is `TIER-XXXXXX`, optionally followed by `--` and the
//! URL-safe base64 of the board document URL:
//!
//! ```text
//! TIER-7KQ2MX
//! TIER-7KQ2MX--aHR0cHM6Ly9ib2FyZHMuZXhhbXBsZS9iLzQy
//! ```

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Prefix shared by every short code
pub const ROOM_CODE_PREFIX: &str = "TIER-";

/// Length of the random part of a short code
pub const ROOM_CODE_LENGTH: usize = 6;

/// Separator between the short code and the embedded document URL
pub const DOCUMENT_SEPARATOR: &str = "--";

/// Characters used in generated codes (no I, O, 0 or 1)
const ROOM_CODE_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

const PASSWORD_SALT_LEN: usize = 16;

/// Parsed room code
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomCode {
    short: String,
    document_url: Option<String>,
}

impl RoomCode {
    /// Generate a fresh short code
    ///
    /// # Panics
    /// Panics if the system random number generator fails.
    pub fn generate() -> Self {
        Self::try_generate().expect("RNG failed - system entropy source unavailable")
    }

    /// Try to generate a fresh short code, returning an error if RNG fails
    pub fn try_generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; ROOM_CODE_LENGTH];
        getrandom::getrandom(&mut bytes)?;

        let code: String = bytes
            .iter()
            .map(|b| ROOM_CODE_CHARS[(*b as usize) % ROOM_CODE_CHARS.len()] as char)
            .collect();

        Ok(Self {
            short: format!("{}{}", ROOM_CODE_PREFIX, code),
            document_url: None,
        })
    }

    /// Attach a document URL to be carried inside the code
    pub fn with_document_url(mut self, url: impl Into<String>) -> Self {
        self.document_url = Some(url.into());
        self
    }

    /// Parse a short or long room code
    ///
    /// Splits on the first `--`; without it there is no embedded URL.
    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let input = input.trim();
        let (short, encoded_url) = match input.split_once(DOCUMENT_SEPARATOR) {
            Some((short, rest)) => (short, Some(rest)),
            None => (input, None),
        };

        let short = normalize_short_code(short)
            .ok_or_else(|| ProtocolError::InvalidRoomCode(input.to_string()))?;

        let document_url = match encoded_url {
            Some(encoded) => {
                let bytes = URL_SAFE_NO_PAD
                    .decode(encoded.trim_end_matches('='))
                    .map_err(|_| ProtocolError::InvalidRoomCode(input.to_string()))?;
                let url = String::from_utf8(bytes)
                    .map_err(|_| ProtocolError::InvalidRoomCode(input.to_string()))?;
                Some(url)
            }
            None => None,
        };

        Ok(Self {
            short,
            document_url,
        })
    }

    /// The `TIER-XXXXXX` part, used as the store key
    pub fn short_code(&self) -> &str {
        &self.short
    }

    pub fn document_url(&self) -> Option<&str> {
        self.document_url.as_deref()
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.document_url {
            Some(url) => write!(
                f,
                "{}{}{}",
                self.short,
                DOCUMENT_SEPARATOR,
                URL_SAFE_NO_PAD.encode(url.as_bytes())
            ),
            None => f.write_str(&self.short),
        }
    }
}

impl FromStr for RoomCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Normalize a short code to `TIER-XXXXXX`
///
/// Accepts the bare six characters, any case, and stray whitespace.
/// Codes minted elsewhere may use any ASCII alphanumerics.
fn normalize_short_code(code: &str) -> Option<String> {
    let compact: String = code
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let body = compact.strip_prefix(ROOM_CODE_PREFIX).unwrap_or(&compact);
    let valid = body.len() == ROOM_CODE_LENGTH && body.bytes().all(|b| b.is_ascii_alphanumeric());
    valid.then(|| format!("{}{}", ROOM_CODE_PREFIX, body))
}

/// Hash a room password as `salt$hash` (hex, BLAKE3)
///
/// Fails only if the system random number generator cannot supply a salt.
pub fn try_hash_password(password: &str) -> Result<String, getrandom::Error> {
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    getrandom::getrandom(&mut salt)?;
    let hash = salted_hash(&salt, password);
    Ok(format!("{}${}", hex::encode(salt), hash.to_hex()))
}

/// Verify a password against a stored `salt$hash`
///
/// The comparison goes through `blake3::Hash`, whose equality is constant-time.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = blake3::Hash::from_hex(hash_hex) else {
        return false;
    };
    salted_hash(&salt, password) == expected
}

fn salted_hash(salt: &[u8], password: &str) -> blake3::Hash {
    let mut hasher = Hasher::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize()
}
