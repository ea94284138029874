//! Link codes.
//!
//! A link code is four characters drawn from uppercase hex digits, with the
//! digit zero remapped to `G` so it can never be confused with the letter O.
//! Codes are validated by exact pattern match (`^[A-Z0-9]{4}$`) before any
//! store access.

use crate::LINK_CODE_LEN;
use crate::error::{RegistryError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated, short-lived link code
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinkCode(String);

impl LinkCode {
    /// Draw a fresh code from the given RNG.
    ///
    /// Two random bytes are rendered as uppercase hex and every `0` becomes
    /// `G`. No collision check is made; the code space and the short TTL make
    /// collisions negligible.
    pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; LINK_CODE_LEN / 2];
        rng.fill_bytes(&mut bytes);
        let code = hex::encode_upper(bytes).replace('0', "G");
        Self(code)
    }

    /// Draw a fresh code from the thread RNG
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Validate a user-supplied code
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidLinkCode`] unless the input is exactly
    /// four ASCII uppercase letters or digits.
    pub fn parse(input: &str) -> Result<Self> {
        if is_valid_code(input) {
            Ok(Self(input.to_string()))
        } else {
            Err(RegistryError::InvalidLinkCode(input.to_string()))
        }
    }

    /// Borrow the code as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_code(input: &str) -> bool {
    input.len() == LINK_CODE_LEN
        && input
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

impl fmt::Display for LinkCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LinkCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkCode({})", self.0)
    }
}

impl TryFrom<String> for LinkCode {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<LinkCode> for String {
    fn from(code: LinkCode) -> Self {
        code.0
    }
}
