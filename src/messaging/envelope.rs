//! Encrypted message envelope
//!
//! The plaintext that gets XORed against the pad. Fields are encoded as
//! tag / length / value records so decoders skip tags they do not know;
//! the serialized length is exactly the number of key bytes a message
//! consumes, so message length is not hidden.
//!
//! Text content is gzip-compressed first, but only when the compressed form
//! is strictly shorter. Binary payloads are never compressed.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::messaging::MessageContent;
use crate::PeerId;

const TAG_SENDER_ID: u8 = 1;
const TAG_CREATED_AT: u8 = 2;
const TAG_FLAGS: u8 = 3;
const TAG_CONTENT_TYPE: u8 = 4;
const TAG_FILE_NAME: u8 = 5;
const TAG_MIME_TYPE: u8 = 6;
const TAG_CONTENT: u8 = 7;

const FLAG_COMPRESSED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text = 1,
    Image = 2,
    File = 3,
}

impl ContentKind {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(ContentKind::Text),
            2 => Ok(ContentKind::Image),
            3 => Ok(ContentKind::File),
            other => Err(Error::DecryptCorrupted(format!(
                "unknown content type {}",
                other
            ))),
        }
    }
}

/// Decoded envelope: everything a message carries besides its ciphertext
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender_id: PeerId,
    pub created_at_ms: u64,
    pub is_compressed: bool,
    pub kind: ContentKind,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub content: Vec<u8>,
}

impl Envelope {
    /// Build an envelope for outgoing content, choosing compression
    pub fn seal(
        sender_id: impl Into<PeerId>,
        created_at_ms: u64,
        content: &MessageContent,
    ) -> Result<Self> {
        let (kind, file_name, mime_type, raw) = match content {
            MessageContent::Text { text } => (ContentKind::Text, None, None, text.as_bytes().to_vec()),
            MessageContent::Image {
                bytes,
                file_name,
                mime_type,
            } => (
                ContentKind::Image,
                Some(file_name.clone()),
                Some(mime_type.clone()),
                bytes.clone(),
            ),
            MessageContent::File {
                bytes,
                file_name,
                mime_type,
            } => (
                ContentKind::File,
                Some(file_name.clone()),
                Some(mime_type.clone()),
                bytes.clone(),
            ),
            MessageContent::Corrupted => {
                return Err(Error::InvalidState(
                    "corrupted placeholder cannot be sent".into(),
                ))
            }
        };

        // compress text only, and only when it actually pays
        let (content, is_compressed) = if kind == ContentKind::Text {
            let compressed = gzip_compress(&raw)?;
            if compressed.len() < raw.len() {
                (compressed, true)
            } else {
                (raw, false)
            }
        } else {
            (raw, false)
        };

        Ok(Self {
            sender_id: sender_id.into(),
            created_at_ms,
            is_compressed,
            kind,
            file_name,
            mime_type,
            content,
        })
    }

    /// Recover the message content, undoing compression
    pub fn open(&self) -> Result<MessageContent> {
        let bytes = if self.is_compressed {
            gzip_decompress(&self.content)?
        } else {
            self.content.clone()
        };

        match self.kind {
            ContentKind::Text => {
                let text = String::from_utf8(bytes).map_err(|_| {
                    Error::DecryptCorrupted("text content is not valid UTF-8".into())
                })?;
                Ok(MessageContent::Text { text })
            }
            ContentKind::Image => Ok(MessageContent::Image {
                bytes,
                file_name: self.file_name.clone().unwrap_or_default(),
                mime_type: self.mime_type.clone().unwrap_or_default(),
            }),
            ContentKind::File => Ok(MessageContent::File {
                bytes,
                file_name: self.file_name.clone().unwrap_or_default(),
                mime_type: self.mime_type.clone().unwrap_or_default(),
            }),
        }
    }

    /// Serialize to the tag-addressed wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(64 + self.content.len());
        write_field(&mut buffer, TAG_SENDER_ID, self.sender_id.as_bytes());
        write_field(&mut buffer, TAG_CREATED_AT, &self.created_at_ms.to_be_bytes());
        let flags = if self.is_compressed { FLAG_COMPRESSED } else { 0 };
        write_field(&mut buffer, TAG_FLAGS, &[flags]);
        write_field(&mut buffer, TAG_CONTENT_TYPE, &[self.kind as u8]);
        if let Some(name) = &self.file_name {
            write_field(&mut buffer, TAG_FILE_NAME, name.as_bytes());
        }
        if let Some(mime) = &self.mime_type {
            write_field(&mut buffer, TAG_MIME_TYPE, mime.as_bytes());
        }
        write_field(&mut buffer, TAG_CONTENT, &self.content);
        buffer
    }

    /// Parse the wire form; unknown tags are skipped for forward
    /// compatibility, missing required tags are corruption.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut sender_id = None;
        let mut created_at_ms = None;
        let mut flags = 0u8;
        let mut kind = None;
        let mut file_name = None;
        let mut mime_type = None;
        let mut content = None;

        while (cursor.position() as usize) < bytes.len() {
            let tag = cursor.read_u8().map_err(truncated)?;
            let len = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
            let mut value = vec![0u8; len];
            cursor.read_exact(&mut value).map_err(truncated)?;

            match tag {
                TAG_SENDER_ID => {
                    sender_id = Some(String::from_utf8(value).map_err(|_| {
                        Error::DecryptCorrupted("sender id is not valid UTF-8".into())
                    })?)
                }
                TAG_CREATED_AT => {
                    if value.len() != 8 {
                        return Err(Error::DecryptCorrupted("bad timestamp length".into()));
                    }
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&value);
                    created_at_ms = Some(u64::from_be_bytes(raw));
                }
                TAG_FLAGS => {
                    if value.len() != 1 {
                        return Err(Error::DecryptCorrupted("bad flags length".into()));
                    }
                    flags = value[0];
                }
                TAG_CONTENT_TYPE => {
                    if value.len() != 1 {
                        return Err(Error::DecryptCorrupted("bad content type length".into()));
                    }
                    kind = Some(ContentKind::from_byte(value[0])?);
                }
                TAG_FILE_NAME => {
                    file_name = Some(String::from_utf8(value).map_err(|_| {
                        Error::DecryptCorrupted("file name is not valid UTF-8".into())
                    })?)
                }
                TAG_MIME_TYPE => {
                    mime_type = Some(String::from_utf8(value).map_err(|_| {
                        Error::DecryptCorrupted("mime type is not valid UTF-8".into())
                    })?)
                }
                TAG_CONTENT => content = Some(value),
                _ => {} // forward compatibility: skip unknown tags
            }
        }

        Ok(Self {
            sender_id: sender_id
                .ok_or_else(|| Error::DecryptCorrupted("missing sender id".into()))?,
            created_at_ms: created_at_ms
                .ok_or_else(|| Error::DecryptCorrupted("missing timestamp".into()))?,
            is_compressed: flags & FLAG_COMPRESSED != 0,
            kind: kind.ok_or_else(|| Error::DecryptCorrupted("missing content type".into()))?,
            file_name,
            mime_type,
            content: content.ok_or_else(|| Error::DecryptCorrupted("missing content".into()))?,
        })
    }
}

fn write_field(buffer: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buffer.push(tag);
    buffer.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buffer.extend_from_slice(value);
}

fn truncated(_: std::io::Error) -> Error {
    Error::DecryptCorrupted("truncated envelope".into())
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| Error::DecryptCorrupted("gzip stream corrupted".into()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip_uncompressed() {
        let content = MessageContent::Text {
            text: "hello".into(),
        };
        let envelope = Envelope::seal("peer-1", 1234, &content).unwrap();
        // "hello" is shorter than any gzip framing
        assert!(!envelope.is_compressed);

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.open().unwrap(), content);
    }

    #[test]
    fn test_long_text_gets_compressed() {
        let content = MessageContent::Text {
            text: "the quick brown fox ".repeat(50),
        };
        let envelope = Envelope::seal("peer-1", 1, &content).unwrap();
        assert!(envelope.is_compressed);
        assert!(envelope.content.len() < 1000);
        assert_eq!(
            Envelope::decode(&envelope.encode()).unwrap().open().unwrap(),
            content
        );
    }

    #[test]
    fn test_binary_never_compressed() {
        let content = MessageContent::File {
            bytes: vec![0u8; 4096], // would compress extremely well
            file_name: "zeros.bin".into(),
            mime_type: "application/octet-stream".into(),
        };
        let envelope = Envelope::seal("peer-1", 1, &content).unwrap();
        assert!(!envelope.is_compressed);
        assert_eq!(envelope.content.len(), 4096);

        let opened = Envelope::decode(&envelope.encode()).unwrap().open().unwrap();
        assert_eq!(opened, content);
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        let envelope = Envelope::seal("peer-1", 7, &MessageContent::Text { text: "hi".into() })
            .unwrap();
        let mut bytes = envelope.encode();
        // append a field from the future
        write_field(&mut bytes, 42, b"from the future");
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_truncation_is_corruption() {
        let envelope = Envelope::seal("peer-1", 7, &MessageContent::Text { text: "hello".into() })
            .unwrap();
        let bytes = envelope.encode();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(matches!(
                Envelope::decode(&bytes[..cut]),
                Err(Error::DecryptCorrupted(_))
            ));
        }
    }

    #[test]
    fn test_garbage_is_corruption() {
        // decrypting with wrong key bytes yields noise like this
        let garbage: Vec<u8> = (0..64).map(|i| (i * 37) as u8).collect();
        assert!(Envelope::decode(&garbage).is_err());
    }

    #[test]
    fn test_invalid_utf8_text_is_corruption() {
        let envelope = Envelope {
            sender_id: "p".into(),
            created_at_ms: 0,
            is_compressed: false,
            kind: ContentKind::Text,
            file_name: None,
            mime_type: None,
            content: vec![0xFF, 0xFE, 0xFD],
        };
        assert!(matches!(
            envelope.open(),
            Err(Error::DecryptCorrupted(_))
        ));
    }
}
