//! Tamper-evident string values, e.g. for cookies.
//!
//! `sign` appends `.` and a base64url BLAKE3 keyed MAC; `unsign` recomputes
//! and compares it in constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use subtle::ConstantTimeEq;

const KEY_CONTEXT: &str = "switchyard 2024 signed value v1";

fn mac(value: &str, secret: &[u8]) -> [u8; 32] {
    let key = blake3::derive_key(KEY_CONTEXT, secret);
    *blake3::keyed_hash(&key, value.as_bytes()).as_bytes()
}

/// Returns `value.signature`.
#[must_use]
pub fn sign(value: &str, secret: impl AsRef<[u8]>) -> String {
    let tag = URL_SAFE_NO_PAD.encode(mac(value, secret.as_ref()));
    format!("{value}.{tag}")
}

/// Returns the original value if `signed` carries a valid signature for
/// `secret`, `None` otherwise.
#[must_use]
pub fn unsign(signed: &str, secret: impl AsRef<[u8]>) -> Option<String> {
    let (value, tag) = signed.rsplit_once('.')?;
    let provided = URL_SAFE_NO_PAD.decode(tag).ok()?;
    let expected = mac(value, secret.as_ref());
    bool::from(expected.as_slice().ct_eq(provided.as_slice())).then(|| value.to_owned())
}
