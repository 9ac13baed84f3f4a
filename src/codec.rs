//! Hash encoding for resource paths.
//!
//! A resource is addressed on the wire by `volume_id + encode(relative_path)`.
//! The encoding is URL-safe base64 without padding, optionally passed through
//! a pluggable [`HashCipher`] so tokens do not reveal the path.

use std::fmt;
use std::sync::Arc;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use crate::{ConnectorError, Result};

/// `[A-Za-z0-9-_]`, no padding on encode, tolerant of `=` padding on decode.
const HASH_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Reversible byte transform applied before base64 encoding.
pub trait HashCipher: Send + Sync {
    /// Transform plain path bytes.
    fn encrypt(&self, plain: Vec<u8>) -> Vec<u8>;

    /// Undo [`HashCipher::encrypt`]; `None` when the input is not a valid token.
    fn decrypt(&self, encrypted: Vec<u8>) -> Option<Vec<u8>>;
}

/// Encoder/decoder between relative paths and hash tokens.
#[derive(Clone, Default)]
pub struct PathCodec {
    cipher: Option<Arc<dyn HashCipher>>,
}

impl fmt::Debug for PathCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathCodec")
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

impl PathCodec {
    /// Create a codec without encryption.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec that passes path bytes through `cipher`.
    pub fn with_cipher(cipher: Arc<dyn HashCipher>) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }

    /// Encode a relative path into a URL-safe token.
    pub fn encode(&self, relative: &str) -> String {
        let bytes = relative.as_bytes().to_vec();
        let bytes = match &self.cipher {
            Some(cipher) => cipher.encrypt(bytes),
            None => bytes,
        };
        HASH_ENGINE.encode(bytes)
    }

    /// Decode a token produced by [`PathCodec::encode`].
    ///
    /// Clients that pad with `.` (a legacy variant of the alphabet) are
    /// accepted as well.
    pub fn decode(&self, token: &str) -> Result<String> {
        let trimmed = token.trim_end_matches(['.', '=']);
        let bytes = HASH_ENGINE
            .decode(trimmed)
            .map_err(|_| ConnectorError::FileNotFound)?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.decrypt(bytes).ok_or(ConnectorError::FileNotFound)?,
            None => bytes,
        };
        String::from_utf8(bytes).map_err(|_| ConnectorError::FileNotFound)
    }
}

/// Check that a token only uses characters safe in URL paths and queries.
pub fn is_url_safe(token: &str) -> bool {
    token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte-wise XOR with a repeating key.
    struct XorCipher(Vec<u8>);

    impl HashCipher for XorCipher {
        fn encrypt(&self, plain: Vec<u8>) -> Vec<u8> {
            plain
                .into_iter()
                .enumerate()
                .map(|(i, b)| b ^ self.0[i % self.0.len()])
                .collect()
        }

        fn decrypt(&self, encrypted: Vec<u8>) -> Option<Vec<u8>> {
            Some(self.encrypt(encrypted))
        }
    }

    const SAMPLES: &[&str] = &[
        "/",
        "/a",
        "/docs/report.pdf",
        "/with space/and+plus=equals",
        "/日本語/ファイル.txt",
        "/📄/deep/nested/path/file.tar.gz",
        "/???/>>>/~~~",
    ];

    #[test]
    fn test_round_trip() {
        let codec = PathCodec::new();
        for path in SAMPLES {
            let token = codec.encode(path);
            assert_eq!(codec.decode(&token).unwrap(), *path);
        }
    }

    #[test]
    fn test_tokens_are_url_safe() {
        let codec = PathCodec::new();
        for path in SAMPLES {
            let token = codec.encode(path);
            assert!(is_url_safe(&token), "unsafe token {token} for {path}");
            assert!(!token.is_empty());
        }
    }

    #[test]
    fn test_root_token() {
        assert_eq!(PathCodec::new().encode("/"), "Lw");
    }

    #[test]
    fn test_decode_accepts_legacy_padding() {
        let codec = PathCodec::new();
        assert_eq!(codec.decode("Lw..").unwrap(), "/");
        assert_eq!(codec.decode("Lw==").unwrap(), "/");
    }

    #[test]
    fn test_decode_invalid_token() {
        let codec = PathCodec::new();
        assert!(matches!(
            codec.decode("@@not-base64@@"),
            Err(ConnectorError::FileNotFound)
        ));
        // 0xFF is not valid UTF-8.
        let token = HASH_ENGINE.encode([0xFFu8, 0xFE]);
        assert!(matches!(
            codec.decode(&token),
            Err(ConnectorError::FileNotFound)
        ));
    }

    #[test]
    fn test_cipher_round_trip() {
        let codec = PathCodec::with_cipher(Arc::new(XorCipher(b"k3y".to_vec())));
        let plain = PathCodec::new();
        for path in SAMPLES {
            let token = codec.encode(path);
            assert!(is_url_safe(&token));
            assert_ne!(token, plain.encode(path));
            assert_eq!(codec.decode(&token).unwrap(), *path);
        }
    }
}
