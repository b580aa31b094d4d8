//! File content: plain text or an embedded binary payload.
//!
//! Editors and build requests carry every file as a string. Binary assets
//! (images) travel as data URLs:
//!
//! ```text
//! data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAA...
//! └─────┬──────┘└──┬──┘└────────┬───────────────┘
//!    prefix     marker       payload
//! ```
//!
//! The shape is decided once, when content enters the model
//! ([`FileContent::from_wire`]), and is never re-sniffed afterwards.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

const DATA_IMAGE_PREFIX: &str = "data:image/";
const BASE64_MARKER: &str = ";base64,";

/// Content of a single project file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileContent {
    /// UTF-8 source text (`.tex`, `.bib`, ...)
    Text(String),
    /// Decoded binary payload (images)
    Binary(Vec<u8>),
}

impl FileContent {
    /// Interpret wire content.
    ///
    /// A `data:image/<type>;base64,` value becomes [`FileContent::Binary`].
    /// If the payload does not decode, the raw string is kept as text so the
    /// file can still be materialized; the failure is logged.
    pub fn from_wire(raw: &str) -> Self {
        let Some(payload) = data_image_payload(raw) else {
            return FileContent::Text(raw.to_owned());
        };

        match STANDARD.decode(payload.trim()) {
            Ok(bytes) => FileContent::Binary(bytes),
            Err(e) => {
                log::warn!(
                    "Embedded image payload is not valid base64 ({e}); keeping {} bytes as text",
                    raw.len()
                );
                FileContent::Text(raw.to_owned())
            }
        }
    }

    /// Render back to the wire representation.
    pub fn to_wire(&self) -> String {
        match self {
            FileContent::Text(text) => text.clone(),
            FileContent::Binary(bytes) => {
                format!("data:{};base64,{}", sniff_image_mime(bytes), STANDARD.encode(bytes))
            }
        }
    }

    /// Bytes as they should land on disk.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(text) => text.as_bytes(),
            FileContent::Binary(bytes) => bytes,
        }
    }

    /// Text view, if this is a text file.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileContent::Text(text) => Some(text),
            FileContent::Binary(_) => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, FileContent::Binary(_))
    }

    /// Size in bytes of the on-disk form.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FileContent {
    fn default() -> Self {
        FileContent::Text(String::new())
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        FileContent::Text(text)
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        FileContent::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        FileContent::Binary(bytes)
    }
}

/// Return the base64 payload of a `data:image/...;base64,` value.
fn data_image_payload(raw: &str) -> Option<&str> {
    let rest = raw.strip_prefix(DATA_IMAGE_PREFIX)?;
    let marker = rest.find(BASE64_MARKER)?;
    let subtype = &rest[..marker];
    if subtype.is_empty() || subtype.contains(char::is_whitespace) {
        return None;
    }
    Some(&rest[marker + BASE64_MARKER.len()..])
}

/// Guess an image MIME type from magic bytes.
fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ if bytes.starts_with(b"<svg") || bytes.starts_with(b"<?xml") => "image/svg+xml",
        _ => "image/png",
    }
}
