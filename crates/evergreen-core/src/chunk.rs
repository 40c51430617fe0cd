use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::StreamError;

/// Structured form of a MIME type string such as `text/plain; charset=utf-8`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mimetype {
    pub kind: String,
    pub subtype: String,
    pub parameters: BTreeMap<String, String>,
}

impl Mimetype {
    pub fn new(kind: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            subtype: subtype.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn text_plain() -> Self {
        Self::new("text", "plain")
    }

    pub fn essence(&self) -> String {
        format!("{}/{}", self.kind, self.subtype)
    }
}

impl fmt::Display for Mimetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BasicMimetypeCodec.stringify(self))
    }
}

/// Converts between MIME strings on the wire and [`Mimetype`].
pub trait MimetypeCodec: Send + Sync {
    fn parse(&self, raw: &str) -> Result<Mimetype, StreamError>;
    fn stringify(&self, mimetype: &Mimetype) -> String;
}

/// `type/subtype; key=value` codec. Parameter values may be double-quoted.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicMimetypeCodec;

impl MimetypeCodec for BasicMimetypeCodec {
    fn parse(&self, raw: &str) -> Result<Mimetype, StreamError> {
        let mut parts = raw.split(';');
        let essence = parts.next().unwrap_or("").trim();
        let (kind, subtype) = essence
            .split_once('/')
            .filter(|(k, s)| !k.is_empty() && !s.is_empty())
            .ok_or_else(|| StreamError::Decode(format!("invalid mimetype: {raw:?}")))?;

        let mut mimetype = Mimetype::new(kind.to_ascii_lowercase(), subtype.to_ascii_lowercase());
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| StreamError::Decode(format!("invalid mimetype parameter: {param:?}")))?;
            let value = value.trim().trim_matches('"');
            mimetype
                .parameters
                .insert(key.trim().to_ascii_lowercase(), value.to_string());
        }
        Ok(mimetype)
    }

    fn stringify(&self, mimetype: &Mimetype) -> String {
        let mut out = mimetype.essence();
        for (key, value) in &mimetype.parameters {
            let needs_quotes = value.is_empty() || value.contains([' ', ';', '"', '=']);
            if needs_quotes {
                out.push_str(&format!("; {key}=\"{}\"", value.replace('"', "")));
            } else {
                out.push_str(&format!("; {key}={value}"));
            }
        }
        out
    }
}

/// Optional descriptive data attached to a chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkMetadata {
    pub mimetype: Option<Mimetype>,
    pub role: Option<String>,
    pub original_file_name: Option<String>,
    pub capture_time: Option<DateTime<Utc>>,
    pub experimental: Vec<serde_json::Value>,
}

impl ChunkMetadata {
    pub fn with_mimetype(mimetype: Mimetype) -> Self {
        Self {
            mimetype: Some(mimetype),
            ..Default::default()
        }
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// A unit of content: inline bytes or a reference to out-of-band content.
#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
    Data {
        metadata: Option<ChunkMetadata>,
        data: Bytes,
    },
    Ref {
        metadata: Option<ChunkMetadata>,
        reference: String,
    },
}

impl Chunk {
    pub fn data(metadata: Option<ChunkMetadata>, data: impl Into<Bytes>) -> Self {
        Self::Data {
            metadata,
            data: data.into(),
        }
    }

    pub fn reference(metadata: Option<ChunkMetadata>, reference: impl Into<String>) -> Self {
        Self::Ref {
            metadata,
            reference: reference.into(),
        }
    }

    /// UTF-8 text chunk tagged `text/plain`.
    pub fn text(text: impl Into<String>) -> Self {
        Self::data(
            Some(ChunkMetadata::with_mimetype(Mimetype::text_plain())),
            Bytes::from(text.into()),
        )
    }

    pub fn metadata(&self) -> Option<&ChunkMetadata> {
        match self {
            Self::Data { metadata, .. } | Self::Ref { metadata, .. } => metadata.as_ref(),
        }
    }

    pub fn mimetype(&self) -> Option<&Mimetype> {
        self.metadata().and_then(|m| m.mimetype.as_ref())
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Data { data, .. } => Some(data),
            Self::Ref { .. } => None,
        }
    }

    /// Inline payload as UTF-8, if it is valid text.
    pub fn as_text(&self) -> Option<&str> {
        self.bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Serializable summary used in log fields.
#[derive(Debug, Serialize)]
pub struct ChunkSummary {
    pub kind: &'static str,
    pub mimetype: Option<String>,
    pub len: usize,
}

impl From<&Chunk> for ChunkSummary {
    fn from(chunk: &Chunk) -> Self {
        match chunk {
            Chunk::Data { data, .. } => Self {
                kind: "data",
                mimetype: chunk.mimetype().map(|m| m.to_string()),
                len: data.len(),
            },
            Chunk::Ref { reference, .. } => Self {
                kind: "ref",
                mimetype: chunk.mimetype().map(|m| m.to_string()),
                len: reference.len(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_mimetype() {
        let m = BasicMimetypeCodec.parse("text/plain").unwrap();
        assert_eq!(m.kind, "text");
        assert_eq!(m.subtype, "plain");
        assert!(m.parameters.is_empty());
    }

    #[test]
    fn parse_parameters_and_quotes() {
        let m = BasicMimetypeCodec
            .parse("Audio/L16; rate=24000; codec=\"pcm s16\"")
            .unwrap();
        assert_eq!(m.essence(), "audio/l16");
        assert_eq!(m.parameters.get("rate").map(String::as_str), Some("24000"));
        assert_eq!(m.parameters.get("codec").map(String::as_str), Some("pcm s16"));
    }

    #[test]
    fn stringify_quotes_when_needed() {
        let m = Mimetype::new("audio", "l16")
            .with_parameter("rate", "24000")
            .with_parameter("codec", "pcm s16");
        assert_eq!(
            BasicMimetypeCodec.stringify(&m),
            "audio/l16; codec=\"pcm s16\"; rate=24000"
        );
        let reparsed = BasicMimetypeCodec.parse(&m.to_string()).unwrap();
        assert_eq!(reparsed, m);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(BasicMimetypeCodec.parse("plain"), Err(StreamError::Decode(_))));
        assert!(BasicMimetypeCodec.parse("text/").is_err());
        assert!(BasicMimetypeCodec.parse("text/plain; charset").is_err());
    }

    #[test]
    fn text_chunk_accessors() {
        let chunk = Chunk::text("hello");
        assert_eq!(chunk.as_text(), Some("hello"));
        assert_eq!(chunk.mimetype().map(Mimetype::essence).as_deref(), Some("text/plain"));

        let r = Chunk::reference(None, "gs://bucket/obj");
        assert!(r.bytes().is_none());
        assert!(r.metadata().is_none());
        let summary = ChunkSummary::from(&r);
        assert_eq!(summary.kind, "ref");
    }
}
