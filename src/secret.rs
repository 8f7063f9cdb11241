//! At-rest encoding for SMTP credentials. Passwords live encoded in
//! configuration and are only revealed inside the session factory.

use base64::prelude::*;

use crate::error::Error;

/// Encodes a plaintext credential for storage in configuration.
pub fn conceal(plain: &str) -> String {
    BASE64_STANDARD.encode(plain.as_bytes())
}

/// Reverses [`conceal`], recovering the plaintext credential.
pub fn reveal(encoded: &str) -> Result<String, Error> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|err| Error::Secret(err.to_string()))?;
    String::from_utf8(bytes).map_err(|_| Error::Secret("credential is not valid utf-8".into()))
}
