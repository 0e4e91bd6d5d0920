//! Payload marshalling between caller values and fixed-capacity byte buffers.
//!
//! Encoding turns a caller value (raw bytes or text) into the bytes written to a
//! segment or carried in a method call. Decoding reverses it; text decoding strips
//! every NUL character because receive buffers are zero-filled before use and the
//! logical end of a string is otherwise unknown.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{IpcError, Result};

/// Text codec applied to a payload.
///
/// `None` at call sites means raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    /// One little-endian 16-bit unit per UTF-16 code unit.
    Utf16,
    Latin1,
    Ascii,
    Hex,
    Base64,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Utf16 => "utf16",
            Self::Latin1 => "latin1",
            Self::Ascii => "ascii",
            Self::Hex => "hex",
            Self::Base64 => "base64",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown encoding '{0}'")]
pub struct UnknownEncoding(pub String);

impl FromStr for Encoding {
    type Err = UnknownEncoding;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "utf16" | "utf-16" | "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Self::Utf16),
            "latin1" | "binary" => Ok(Self::Latin1),
            "ascii" => Ok(Self::Ascii),
            "hex" => Ok(Self::Hex),
            "base64" => Ok(Self::Base64),
            _ => Err(UnknownEncoding(s.to_string())),
        }
    }
}

/// A caller value on its way into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(value: &'a [u8]) -> Self {
        Self::Bytes(value)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Payload<'a> {
    fn from(value: &'a [u8; N]) -> Self {
        Self::Bytes(value)
    }
}

impl<'a> From<&'a Vec<u8>> for Payload<'a> {
    fn from(value: &'a Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(value: &'a str) -> Self {
        Self::Text(value)
    }
}

impl<'a> From<&'a String> for Payload<'a> {
    fn from(value: &'a String) -> Self {
        Self::Text(value)
    }
}

/// A decoded value: raw bytes when no encoding was requested, text otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Bytes(Vec<u8>),
    Text(String),
}

impl Content {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::Text(t) => t.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Bytes(_) => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(t) => Some(t),
            Self::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(b) => b,
            Self::Text(t) => t.into_bytes(),
        }
    }
}

/// Encode a value into transfer bytes. Byte input passes through without a copy.
pub fn encode<'a>(value: impl Into<Payload<'a>>, encoding: Option<Encoding>) -> Result<Cow<'a, [u8]>> {
    let text = match value.into() {
        Payload::Bytes(bytes) => return Ok(Cow::Borrowed(bytes)),
        Payload::Text(text) => text,
    };

    let bytes = match encoding.unwrap_or(Encoding::Utf8) {
        Encoding::Utf8 => return Ok(Cow::Borrowed(text.as_bytes())),
        Encoding::Utf16 => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        // Best effort: characters outside the codec keep their low byte.
        Encoding::Latin1 | Encoding::Ascii => text.chars().map(|c| c as u32 as u8).collect(),
        Encoding::Hex => hex::decode(text).map_err(|e| IpcError::Encoding {
            encoding: Encoding::Hex,
            reason: e.to_string(),
        })?,
        Encoding::Base64 => BASE64.decode(text.trim()).map_err(|e| IpcError::Encoding {
            encoding: Encoding::Base64,
            reason: e.to_string(),
        })?,
    };
    Ok(Cow::Owned(bytes))
}

/// Decode a received buffer. Without an encoding the buffer is returned untouched.
pub fn decode(buffer: Vec<u8>, encoding: Option<Encoding>) -> Content {
    match encoding {
        None => Content::Bytes(buffer),
        Some(encoding) => Content::Text(decode_text(&buffer, encoding)),
    }
}

/// Decode a buffer as text and drop every NUL character from the result.
pub fn decode_text(buffer: &[u8], encoding: Encoding) -> String {
    let mut text = match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(buffer).into_owned(),
        Encoding::Utf16 => {
            let units: Vec<u16> = buffer
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        Encoding::Latin1 => buffer.iter().map(|&b| b as char).collect(),
        Encoding::Ascii => buffer.iter().map(|&b| (b & 0x7f) as char).collect(),
        Encoding::Hex => hex::encode(buffer),
        Encoding::Base64 => BASE64.encode(buffer),
    };
    text.retain(|c| c != '\0');
    text
}
