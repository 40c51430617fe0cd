//! JSON wire envelope exchanged with the remote action host.
//!
//! Field names are camelCase on the wire. Every field is optional when
//! decoding so that partial fragments from the peer still parse; the
//! demultiplexer decides what a missing field means.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use evergreen_core::{Chunk, ChunkMetadata, MimetypeCodec, StreamError, StreamId};

/// Top-level message in either direction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_fragments: Vec<NodeFragment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

impl SessionMessage {
    pub fn fragments(fragments: Vec<NodeFragment>) -> Self {
        Self {
            node_fragments: fragments,
            actions: Vec::new(),
        }
    }

    pub fn action(action: Action) -> Self {
        Self {
            node_fragments: Vec::new(),
            actions: vec![action],
        }
    }
}

/// One piece of a logical content tree.
///
/// With `child_ids` it is a tree node whose payload lives in the children;
/// without, it is a leaf carrying payload for `id` directly.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub continued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_ids: Option<Vec<StreamId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_fragment: Option<WireChunk>,
}

impl NodeFragment {
    pub fn leaf(id: StreamId, seq: u64, continued: bool, chunk: Option<WireChunk>) -> Self {
        Self {
            id: Some(id),
            seq: Some(seq),
            continued,
            child_ids: None,
            chunk_fragment: chunk,
        }
    }

    pub fn node(id: StreamId, seq: u64, continued: bool, child_ids: Vec<StreamId>) -> Self {
        Self {
            id: Some(id),
            seq: Some(seq),
            continued,
            child_ids: Some(child_ids),
            chunk_fragment: None,
        }
    }

    pub fn is_tree_node(&self) -> bool {
        self.child_ids.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experimental: Vec<serde_json::Value>,
}

/// Chunk as it travels: base64 `data` or a `ref`, never both.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WireMetadata>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedId {
    pub name: String,
    pub id: StreamId,
}

/// Invocation envelope naming the target and the wire id of every field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub target_spec: TargetSpec,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<NamedId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<NamedId>,
    #[serde(default)]
    pub configs: Vec<serde_json::Value>,
}

fn encode_metadata(metadata: &ChunkMetadata, codec: &dyn MimetypeCodec) -> WireMetadata {
    WireMetadata {
        mimetype: metadata.mimetype.as_ref().map(|m| codec.stringify(m)),
        role: metadata.role.clone(),
        original_file_name: metadata.original_file_name.clone(),
        capture_time: metadata.capture_time,
        experimental: metadata.experimental.clone(),
    }
}

fn decode_metadata(wire: WireMetadata, codec: &dyn MimetypeCodec) -> Result<ChunkMetadata, StreamError> {
    let mimetype = wire.mimetype.as_deref().map(|m| codec.parse(m)).transpose()?;
    Ok(ChunkMetadata {
        mimetype,
        role: wire.role,
        original_file_name: wire.original_file_name,
        capture_time: wire.capture_time,
        experimental: wire.experimental,
    })
}

/// Chunk → wire form. Inline bytes are base64-encoded.
pub fn encode_chunk(chunk: &Chunk, codec: &dyn MimetypeCodec) -> WireChunk {
    let metadata = chunk.metadata().map(|m| encode_metadata(m, codec));
    match chunk {
        Chunk::Data { data, .. } => WireChunk {
            metadata,
            reference: None,
            data: Some(STANDARD.encode(data)),
        },
        Chunk::Ref { reference, .. } => WireChunk {
            metadata,
            reference: Some(reference.clone()),
            data: None,
        },
    }
}

/// Wire form → chunk. `Ok(None)` when the fragment carries no payload.
pub fn decode_chunk(wire: WireChunk, codec: &dyn MimetypeCodec) -> Result<Option<Chunk>, StreamError> {
    let metadata = wire.metadata.map(|m| decode_metadata(m, codec)).transpose()?;
    match (wire.data, wire.reference) {
        (Some(_), Some(_)) => Err(StreamError::Decode(
            "chunk carries both data and ref".into(),
        )),
        (Some(data), None) => {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| StreamError::Decode(format!("invalid base64 payload: {e}")))?;
            Ok(Some(Chunk::Data {
                metadata,
                data: Bytes::from(bytes),
            }))
        }
        (None, Some(reference)) => Ok(Some(Chunk::Ref { metadata, reference })),
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evergreen_core::{BasicMimetypeCodec, Mimetype};

    #[test]
    fn fragment_uses_camel_case_and_omits_absent_fields() {
        let fragment = NodeFragment::node(
            StreamId::from_raw("p"),
            0,
            false,
            vec![StreamId::from_raw("c1"), StreamId::from_raw("c2")],
        );
        let json = serde_json::to_value(&fragment).unwrap();
        assert_eq!(json["childIds"], serde_json::json!(["c1", "c2"]));
        assert_eq!(json["continued"], false);
        assert!(json.get("chunkFragment").is_none());
    }

    #[test]
    fn parses_sparse_peer_fragments() {
        let raw = r#"{"nodeFragments":[{"id":"c","chunkFragment":{"data":"aGk="}}]}"#;
        let msg: SessionMessage = serde_json::from_str(raw).unwrap();
        let fragment = &msg.node_fragments[0];
        assert_eq!(fragment.id.as_ref().map(StreamId::as_str), Some("c"));
        assert_eq!(fragment.seq, None);
        assert!(!fragment.continued);
        assert!(!fragment.is_tree_node());
        assert!(msg.actions.is_empty());
    }

    #[test]
    fn action_envelope_shape() {
        let action = Action {
            target_spec: TargetSpec { id: "models/gemini".into() },
            name: "generateContent".into(),
            inputs: vec![NamedId { name: "prompt".into(), id: StreamId::from_raw("in-1") }],
            outputs: vec![NamedId { name: "output".into(), id: StreamId::from_raw("out-1") }],
            configs: Vec::new(),
        };
        let json = serde_json::to_value(SessionMessage::action(action)).unwrap();
        assert!(json.get("nodeFragments").is_none());
        let a = &json["actions"][0];
        assert_eq!(a["targetSpec"]["id"], "models/gemini");
        assert_eq!(a["inputs"][0]["name"], "prompt");
        assert_eq!(a["outputs"][0]["id"], "out-1");
        assert_eq!(a["configs"], serde_json::json!([]));
    }

    #[test]
    fn data_chunk_is_base64_with_stringified_mimetype() {
        let chunk = Chunk::data(
            Some(ChunkMetadata::with_mimetype(
                Mimetype::new("audio", "l16").with_parameter("rate", "24000"),
            )),
            Bytes::from_static(b"\x00\x01\x02"),
        );
        let wire = encode_chunk(&chunk, &BasicMimetypeCodec);
        assert_eq!(wire.data.as_deref(), Some("AAEC"));
        assert_eq!(
            wire.metadata.as_ref().and_then(|m| m.mimetype.as_deref()),
            Some("audio/l16; rate=24000")
        );

        let decoded = decode_chunk(wire, &BasicMimetypeCodec).unwrap().unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn ref_chunk_uses_ref_key() {
        let chunk = Chunk::reference(None, "files/abc");
        let json = serde_json::to_value(encode_chunk(&chunk, &BasicMimetypeCodec)).unwrap();
        assert_eq!(json["ref"], "files/abc");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn payload_less_chunk_decodes_to_none() {
        let wire = WireChunk {
            metadata: Some(WireMetadata { role: Some("model".into()), ..Default::default() }),
            ..Default::default()
        };
        assert_eq!(decode_chunk(wire, &BasicMimetypeCodec).unwrap(), None);
    }

    #[test]
    fn rejects_malformed_payloads() {
        let both = WireChunk {
            metadata: None,
            reference: Some("r".into()),
            data: Some("aGk=".into()),
        };
        assert!(matches!(decode_chunk(both, &BasicMimetypeCodec), Err(StreamError::Decode(_))));

        let bad_base64 = WireChunk { data: Some("%%%".into()), ..Default::default() };
        assert!(decode_chunk(bad_base64, &BasicMimetypeCodec).is_err());

        let bad_mimetype = WireChunk {
            metadata: Some(WireMetadata { mimetype: Some("nonsense".into()), ..Default::default() }),
            data: Some("aGk=".into()),
            ..Default::default()
        };
        assert!(decode_chunk(bad_mimetype, &BasicMimetypeCodec).is_err());
    }
}
