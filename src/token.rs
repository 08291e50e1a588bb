//! Subscription tokens.
//!
//! A token binds a recipient address to proof of issuance:
//!
//! ```text
//! base64(email) ":" base64(32 random bytes)
//! ```
//!
//! Only the address half is ever read back. The random half makes every
//! issued token unique and unguessable, but [`parse`] never checks it against
//! the value stored on the subscription record.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use percent_encoding::percent_decode_str;
use rand::rngs::OsRng;
use rand::TryRngCore;
use thiserror::Error;

/// Number of random bytes in the proof half of a token.
pub const TOKEN_RANDOM_BYTES: usize = 32;

const SEPARATOR: char = ':';

/// Errors produced while issuing or reading tokens.
#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    /// The OS random source could not produce bytes
    #[error("random source unavailable: {0}")]
    RandomSource(String),

    /// The token is not exactly two colon-separated parts
    #[error("invalid token: expected exactly one '{SEPARATOR}' separator")]
    Malformed,

    /// The address half is not valid base64 or not UTF-8
    #[error("invalid token: address part is not decodable: {0}")]
    InvalidEncoding(String),

    /// A `%` escape in the transported token is broken
    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),
}

/// Issue a fresh token for `email`.
pub fn generate(email: &str) -> Result<String, TokenError> {
    let mut proof = [0u8; TOKEN_RANDOM_BYTES];
    OsRng
        .try_fill_bytes(&mut proof)
        .map_err(|e| TokenError::RandomSource(e.to_string()))?;

    Ok(format!(
        "{}{SEPARATOR}{}",
        STANDARD.encode(email.as_bytes()),
        STANDARD.encode(proof)
    ))
}

/// Recover the address a token was issued for.
pub fn parse(token: &str) -> Result<String, TokenError> {
    let mut parts = token.split(SEPARATOR);
    let address_part = match (parts.next(), parts.next(), parts.next()) {
        (Some(address), Some(_proof), None) => address,
        _ => return Err(TokenError::Malformed),
    };

    let bytes = STANDARD
        .decode(address_part)
        .map_err(|e| TokenError::InvalidEncoding(e.to_string()))?;

    String::from_utf8(bytes).map_err(|e| TokenError::InvalidEncoding(e.to_string()))
}

/// Undo the query-string escaping a token picks up inside a verification
/// link (`+` -> `%2B`, `/` -> `%2F`, `=` -> `%3D`).
///
/// Fails on a `%` that is not followed by two hex digits.
pub fn unescape(raw: &str) -> Result<String, TokenError> {
    let bytes = raw.as_bytes();
    for (i, _) in raw.match_indices('%') {
        let valid = bytes
            .get(i + 1..i + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
        if !valid {
            return Err(TokenError::InvalidEscape(i));
        }
    }

    // Form decoding: `+` is a space
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| TokenError::InvalidEncoding(e.to_string()))
}
