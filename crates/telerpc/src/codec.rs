//! # Payload Codec
//!
//! The serialization contract the runtime consumes, and its JSON implementation.
//!
//! ## Format
//!
//! A `Payload` is opaque bytes plus the list of streams the bytes refer to.
//! Inside the JSON document a stream is written as a single-key object
//! `{"$stream": <id>}` at the position it occupies. The key is reserved.
//!
//! ## Invariants
//! - Every marker in `data` has exactly one entry in `streams`, and vice versa.
//! - Decoding returns stream references in the order the payload lists them.

use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::ids::ServiceId;
use crate::ids::StreamId;
use crate::signature::MethodSignature;
use crate::signature::ParamKind;

/// Reserved object key marking an embedded stream.
pub const STREAM_MARKER: &str = "$stream";

/// Encoded data plus the streams it embeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub data: Vec<u8>,
    pub streams: Vec<StreamRef>,
}

/// Describes one stream embedded in a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    pub id: StreamId,
    /// Display name for diagnostics.
    pub name: String,
}

impl StreamRef {
    pub fn new(id: StreamId, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

/// One argument position, as seen by the codec.
#[derive(Debug, Clone)]
pub enum ArgSlot<'a> {
    Value(&'a Value),
    Stream(StreamRef),
}

/// The JSON marker standing in for stream `id`.
pub fn stream_marker(id: StreamId) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(STREAM_MARKER.to_string(), Value::from(id.0));
    Value::Object(map)
}

/// Encodes and decodes argument lists, results, and stream elements.
pub trait Serialization: Send + Sync + 'static {
    /// Encodes an argument list after checking it against `signature`.
    fn encode_args(&self, signature: &MethodSignature, args: &[ArgSlot<'_>]) -> Result<Payload>;

    /// Decodes an argument list. The inverse of `encode_args`.
    fn decode_args(&self, payload: &Payload) -> Result<(Vec<Value>, Vec<StreamRef>)>;

    /// Encodes a single value. Markers already placed in `value` must match `streams`.
    fn encode_value(&self, value: &Value, streams: Vec<StreamRef>) -> Result<Payload>;

    /// Decodes a single value and the streams it embeds.
    fn decode_value(&self, payload: &Payload) -> Result<(Value, Vec<StreamRef>)>;

    /// Decodes the service id returned by a handle-returning method.
    fn decode_handle(&self, payload: &Payload) -> Result<ServiceId> {
        let (value, streams) = self.decode_value(payload)?;
        if let Some(stream) = streams.first() {
            return Err(Error::InvalidHandle(format!("handle embeds {}", stream.id)));
        }
        match value {
            Value::String(path) => Ok(ServiceId(path)),
            other => Err(Error::InvalidHandle(format!("expected a service path, got {}", other))),
        }
    }
}

/// `serde_json` backed codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerialization;

impl JsonSerialization {
    pub fn new() -> Self {
        Self
    }
}

impl Serialization for JsonSerialization {
    fn encode_args(&self, signature: &MethodSignature, args: &[ArgSlot<'_>]) -> Result<Payload> {
        if args.len() != signature.params.len() {
            return Err(Error::ArgumentCount {
                method: signature.name.clone(),
                expected: signature.params.len(),
                found: args.len(),
            });
        }

        let mut items = Vec::with_capacity(args.len());
        let mut streams = Vec::new();

        for (index, (slot, kind)) in args.iter().zip(&signature.params).enumerate() {
            match (slot, kind) {
                (ArgSlot::Value(value), ParamKind::Value) => {
                    // Values may not smuggle streams in by hand.
                    if let Some(id) = collect_markers(value).into_iter().next() {
                        return Err(Error::UnknownStream(id));
                    }
                    items.push((*value).clone());
                }
                (ArgSlot::Stream(stream), ParamKind::Stream) => {
                    items.push(stream_marker(stream.id));
                    streams.push(stream.clone());
                }
                (_, expected) => {
                    return Err(Error::ArgumentKind {
                        method: signature.name.clone(),
                        index,
                        expected: *expected,
                    });
                }
            }
        }

        let data = serde_json::to_vec(&Value::Array(items))?;
        Ok(Payload { data, streams })
    }

    fn decode_args(&self, payload: &Payload) -> Result<(Vec<Value>, Vec<StreamRef>)> {
        let (value, streams) = self.decode_value(payload)?;
        match value {
            Value::Array(items) => Ok((items, streams)),
            other => Err(Error::Serialization(format!("argument list is not an array: {}", other))),
        }
    }

    fn encode_value(&self, value: &Value, streams: Vec<StreamRef>) -> Result<Payload> {
        check_markers(value, &streams)?;
        let data = serde_json::to_vec(value)?;
        Ok(Payload { data, streams })
    }

    fn decode_value(&self, payload: &Payload) -> Result<(Value, Vec<StreamRef>)> {
        let value: Value = serde_json::from_slice(&payload.data)?;
        check_markers(&value, &payload.streams)?;
        Ok((value, payload.streams.clone()))
    }
}

/// Verifies that the markers in `value` and the descriptor list agree exactly.
fn check_markers(value: &Value, streams: &[StreamRef]) -> Result<()> {
    let referenced = collect_markers(value);
    let mut described = HashSet::with_capacity(streams.len());

    for stream in streams {
        if !described.insert(stream.id) || !referenced.contains(&stream.id) {
            return Err(Error::UnreferencedStream(stream.id));
        }
    }

    match referenced.into_iter().find(|id| !described.contains(id)) {
        Some(id) => Err(Error::UnknownStream(id)),
        None => Ok(()),
    }
}

/// Collects the ids of every stream marker in `value`.
pub fn collect_markers(value: &Value) -> HashSet<StreamId> {
    let mut found = HashSet::new();
    let mut pending = vec![value];

    while let Some(value) = pending.pop() {
        match value {
            Value::Object(map) => {
                if let Some(id) = marker_id(map) {
                    found.insert(id);
                } else {
                    pending.extend(map.values());
                }
            }
            Value::Array(items) => pending.extend(items),
            _ => {}
        }
    }

    found
}

fn marker_id(map: &serde_json::Map<String, Value>) -> Option<StreamId> {
    if map.len() != 1 {
        return None;
    }
    map.get(STREAM_MARKER).and_then(Value::as_u64).map(StreamId)
}
