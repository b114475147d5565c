//! Identity Resolving Key encodings.
//!
//! Downstream presence-detection tools disagree on how an IRK should be
//! written down, so a captured key is rendered four ways at once:
//!
//! | Field | Format | Example consumer |
//! |---|---|---|
//! | `hex` | 32 lowercase hex chars, byte order as received | generic tooling |
//! | `reversed_hex` | 32 hex chars, byte 15 first | ESPresense |
//! | `base64` | RFC 4648 standard alphabet with `=` padding | Home Assistant Private BLE Device |
//! | `array_literal` | `0xHH` tokens joined by `,` | C/C++ firmware sources |
//!
//! The output is bit-exact; the inverse parsers exist so the round-trip laws
//! can be checked and so keys can be read back from persistent bond records.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Length of an Identity Resolving Key in bytes.
pub const KEY_LEN: usize = 16;

/// A 128-bit Identity Resolving Key.
///
/// `Debug` never prints the key material.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey([u8; KEY_LEN]);

impl IdentityKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes, in the order they were received.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The same key with its byte order reversed.
    #[must_use]
    pub fn reversed(&self) -> Self {
        let mut bytes = self.0;
        bytes.reverse();
        Self(bytes)
    }

    /// Render every encoding of this key.
    #[must_use]
    pub fn encodings(&self) -> KeyEncodingSet {
        KeyEncodingSet::encode(self)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityKey(<redacted>)")
    }
}

impl From<[u8; KEY_LEN]> for IdentityKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for IdentityKey {
    type Error = CodecError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CodecError::InvalidLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }
}

impl FromStr for IdentityKey {
    type Err = CodecError;

    /// Parses the 32-character hex form, in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex(s)
    }
}

/// Errors produced when parsing an encoded key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The decoded key is not exactly [`KEY_LEN`] bytes long.
    #[error("Identity key must be {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length in bytes.
        expected: usize,
        /// Decoded length in bytes.
        actual: usize,
    },

    /// The input is not valid hexadecimal.
    #[error("Invalid hex key: {0}")]
    InvalidHex(String),

    /// The input is not valid padded base64.
    #[error("Invalid base64 key: {0}")]
    InvalidBase64(String),

    /// A token of an array literal is not of the form `0xHH`.
    #[error("Invalid array literal token {index}: '{token}'")]
    InvalidToken {
        /// Zero-based token position.
        index: usize,
        /// The offending token.
        token: String,
    },
}

/// The four textual renderings of one [`IdentityKey`].
///
/// Always built in a single pass by [`KeyEncodingSet::encode`], so the fields
/// never describe different keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "hex": "00112233445566778899aabbccddeeff",
    "reversed_hex": "ffeeddccbbaa99887766554433221100",
    "base64": "ABEiM0RVZneImaq7zN3u/w==",
    "array_literal": "0x00,0x11,0x22,0x33,0x44,0x55,0x66,0x77,0x88,0x99,0xaa,0xbb,0xcc,0xdd,0xee,0xff"
}))]
pub struct KeyEncodingSet {
    /// Lowercase hex, byte order unchanged.
    pub hex: String,

    /// Lowercase hex of the byte-reversed key.
    pub reversed_hex: String,

    /// Standard padded base64.
    pub base64: String,

    /// Comma-separated `0xHH` tokens.
    pub array_literal: String,
}

impl KeyEncodingSet {
    /// Encode `key` into all four representations.
    #[must_use]
    pub fn encode(key: &IdentityKey) -> Self {
        Self {
            hex: encode_hex(key),
            reversed_hex: encode_reversed_hex(key),
            base64: encode_base64(key),
            array_literal: encode_array_literal(key),
        }
    }
}

/// 32 lowercase hex characters.
#[must_use]
pub fn encode_hex(key: &IdentityKey) -> String {
    hex::encode(key.as_bytes())
}

/// Hex of the byte-reversed key (byte 15 first).
#[must_use]
pub fn encode_reversed_hex(key: &IdentityKey) -> String {
    encode_hex(&key.reversed())
}

/// Standard base64 with padding; 16 bytes always encode to 24 characters.
#[must_use]
pub fn encode_base64(key: &IdentityKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// `0x00,0x11,...` with no brackets or spaces.
#[must_use]
pub fn encode_array_literal(key: &IdentityKey) -> String {
    key.as_bytes()
        .iter()
        .map(|b| format!("0x{b:02x}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse the hex form produced by [`encode_hex`].
///
/// # Errors
///
/// Returns [`CodecError::InvalidHex`] for non-hex input and
/// [`CodecError::InvalidLength`] if it does not decode to 16 bytes.
pub fn decode_hex(s: &str) -> Result<IdentityKey, CodecError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CodecError::InvalidHex(e.to_string()))?;
    IdentityKey::try_from(bytes.as_slice())
}

/// Parse the base64 form produced by [`encode_base64`].
///
/// # Errors
///
/// Returns [`CodecError::InvalidBase64`] or [`CodecError::InvalidLength`].
pub fn decode_base64(s: &str) -> Result<IdentityKey, CodecError> {
    let bytes = STANDARD
        .decode(s.trim())
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    IdentityKey::try_from(bytes.as_slice())
}

/// Parse the array form produced by [`encode_array_literal`].
///
/// Whitespace around tokens and an upper-case `0X` prefix are tolerated.
///
/// # Errors
///
/// Returns [`CodecError::InvalidToken`] or [`CodecError::InvalidLength`].
pub fn parse_array_literal(s: &str) -> Result<IdentityKey, CodecError> {
    let bytes = s
        .split(',')
        .enumerate()
        .map(|(index, raw)| {
            let token = raw.trim();
            token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .filter(|digits| (1..=2).contains(&digits.len()))
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| CodecError::InvalidToken {
                    index,
                    token: token.to_string(),
                })
        })
        .collect::<Result<Vec<u8>, _>>()?;
    IdentityKey::try_from(bytes.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: [u8; KEY_LEN] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    #[test]
    fn test_known_vector() {
        let set = KeyEncodingSet::encode(&IdentityKey::from_bytes(SAMPLE));
        assert_eq!(set.hex, "00112233445566778899aabbccddeeff");
        assert_eq!(set.reversed_hex, "ffeeddccbbaa99887766554433221100");
        assert_eq!(set.base64, "ABEiM0RVZneImaq7zN3u/w==");
        assert_eq!(
            set.array_literal,
            "0x00,0x11,0x22,0x33,0x44,0x55,0x66,0x77,0x88,0x99,0xaa,0xbb,0xcc,0xdd,0xee,0xff"
        );
    }

    #[test]
    fn test_all_zero_key() {
        let set = IdentityKey::from_bytes([0; KEY_LEN]).encodings();
        assert_eq!(set.hex, "0".repeat(32));
        assert_eq!(set.base64, "AAAAAAAAAAAAAAAAAAAAAA==");
        assert_eq!(set.array_literal.matches("0x00").count(), KEY_LEN);
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let key = IdentityKey::from_bytes(SAMPLE);
        let debug = format!("{key:?}");
        assert!(!debug.contains("11"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_decode_hex_accepts_uppercase() {
        let key: IdentityKey = "00112233445566778899AABBCCDDEEFF".parse().unwrap();
        assert_eq!(key.as_bytes(), &SAMPLE);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(
            decode_hex("0011"),
            Err(CodecError::InvalidLength {
                expected: KEY_LEN,
                actual: 2
            })
        );
        assert!(matches!(
            decode_base64("AAAA"),
            Err(CodecError::InvalidLength { actual: 3, .. })
        ));
        assert!(matches!(
            parse_array_literal("0x01,0x02"),
            Err(CodecError::InvalidLength { actual: 2, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_hex("zz"), Err(CodecError::InvalidHex(_))));
        assert!(matches!(
            decode_base64("!!!!"),
            Err(CodecError::InvalidBase64(_))
        ));
        assert_eq!(
            parse_array_literal("0x00,12,0x22"),
            Err(CodecError::InvalidToken {
                index: 1,
                token: "12".to_string()
            })
        );
        assert!(matches!(
            parse_array_literal("0x100"),
            Err(CodecError::InvalidToken { index: 0, .. })
        ));
    }

    #[test]
    fn test_try_from_slice() {
        assert!(IdentityKey::try_from(&SAMPLE[..]).is_ok());
        assert!(IdentityKey::try_from(&SAMPLE[..15]).is_err());
    }

    proptest! {
        #[test]
        fn test_hex_round_trip(bytes in any::<[u8; KEY_LEN]>()) {
            let key = IdentityKey::from_bytes(bytes);
            let hex = encode_hex(&key);
            prop_assert_eq!(hex.len(), 32);
            prop_assert_eq!(hex.to_lowercase(), hex.clone());
            prop_assert_eq!(decode_hex(&hex).unwrap(), key);
        }

        #[test]
        fn test_base64_round_trip(bytes in any::<[u8; KEY_LEN]>()) {
            let key = IdentityKey::from_bytes(bytes);
            let b64 = encode_base64(&key);
            prop_assert_eq!(b64.len(), 24);
            prop_assert!(b64.ends_with("=="));
            prop_assert_eq!(decode_base64(&b64).unwrap(), key);
        }

        #[test]
        fn test_array_literal_round_trip(bytes in any::<[u8; KEY_LEN]>()) {
            let key = IdentityKey::from_bytes(bytes);
            let literal = encode_array_literal(&key);
            prop_assert!(!literal.contains(' '));
            prop_assert_eq!(literal.split(',').count(), KEY_LEN);
            prop_assert_eq!(parse_array_literal(&literal).unwrap(), key);
        }

        #[test]
        fn test_reversed_hex_law(bytes in any::<[u8; KEY_LEN]>()) {
            let key = IdentityKey::from_bytes(bytes);
            let mut reversed = bytes;
            reversed.reverse();
            prop_assert_eq!(
                encode_reversed_hex(&key),
                encode_hex(&IdentityKey::from_bytes(reversed))
            );

            let set = key.encodings();
            let redecoded = decode_hex(&set.hex).unwrap().reversed();
            prop_assert_eq!(encode_hex(&redecoded), set.reversed_hex);
        }
    }
}
