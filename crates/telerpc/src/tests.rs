use crate::*;
use crate::codec::stream_marker;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use serde_json::json;

// ============================================================================
//  RANDOM VALUE GENERATION
// ============================================================================

const ALPHABET: &[char] = &['a', 'b', 'z', 'Q', '0', '9', ' ', '"', '\\', 'é', '🦀', '\n'];

fn random_string(rng: &mut StdRng) -> String {
    let len = rng.gen_range(0..12);
    (0..len).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())]).collect()
}

/// Builds a random JSON tree. Floats are multiples of 1/4 so they survive text exactly.
fn random_value(rng: &mut StdRng, depth: u32) -> Value {
    let leaf_only = depth == 0;
    match rng.gen_range(0..if leaf_only { 5 } else { 7 }) {
        0 => Value::Null,
        1 => Value::Bool(rng.gen_bool(0.5)),
        2 => json!(rng.gen_range(i64::MIN..i64::MAX)),
        3 => json!(rng.gen_range(-4000i64..4000) as f64 / 4.0),
        4 => Value::String(random_string(rng)),
        5 => Value::Array((0..rng.gen_range(0..5)).map(|_| random_value(rng, depth - 1)).collect()),
        _ => {
            let mut map = serde_json::Map::new();
            for _ in 0..rng.gen_range(0..5) {
                map.insert(random_string(rng), random_value(rng, depth - 1));
            }
            Value::Object(map)
        }
    }
}

// ============================================================================
//  ROUND TRIPS
// ============================================================================

#[test]
fn test_args_roundtrip_random_trees() -> Result<()> {
    let codec = JsonSerialization::new();
    let mut rng = StdRng::seed_from_u64(0x7e1e);

    for _ in 0..500 {
        let arity = rng.gen_range(0..6);
        let args: Vec<Value> = (0..arity).map(|_| random_value(&mut rng, 4)).collect();
        let sig = MethodSignature::values("random", arity);
        let slots: Vec<ArgSlot> = args.iter().map(ArgSlot::Value).collect();

        let payload = codec.encode_args(&sig, &slots)?;
        let (decoded, streams) = codec.decode_args(&payload)?;

        assert_eq!(decoded, args);
        assert!(streams.is_empty());
    }
    Ok(())
}

#[test]
fn test_value_roundtrip_random_trees() -> Result<()> {
    let codec = JsonSerialization::new();
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..500 {
        let value = random_value(&mut rng, 5);
        let payload = codec.encode_value(&value, Vec::new())?;
        let (decoded, _) = codec.decode_value(&payload)?;
        assert_eq!(decoded, value);
    }
    Ok(())
}

#[test]
fn test_stream_arguments_become_markers() -> Result<()> {
    let codec = JsonSerialization::new();
    let sig = MethodSignature::new("upload", vec![ParamKind::Value, ParamKind::Stream], ReturnKind::Value);
    let name = json!("report.txt");
    let stream = StreamRef::new(StreamId(7), "chunks");

    let payload = codec.encode_args(&sig, &[ArgSlot::Value(&name), ArgSlot::Stream(stream.clone())])?;
    assert_eq!(payload.streams, vec![stream.clone()]);

    let (args, streams) = codec.decode_args(&payload)?;
    assert_eq!(args, vec![name, stream_marker(StreamId(7))]);
    assert_eq!(streams, vec![stream]);
    Ok(())
}

#[test]
fn test_value_with_nested_streams_roundtrips() -> Result<()> {
    let codec = JsonSerialization::new();
    let value = json!({
        "logs": stream_marker(StreamId(1)),
        "nested": [{ "metrics": stream_marker(StreamId(2)) }],
    });
    let streams = vec![StreamRef::new(StreamId(1), "logs"), StreamRef::new(StreamId(2), "metrics")];

    let payload = codec.encode_value(&value, streams.clone())?;
    let (decoded, refs) = codec.decode_value(&payload)?;

    assert_eq!(decoded, value);
    assert_eq!(refs, streams);
    Ok(())
}

// ============================================================================
//  REJECTIONS
// ============================================================================

#[test]
fn test_argument_count_mismatch() {
    let codec = JsonSerialization::new();
    let sig = MethodSignature::values("get", 2);
    let only = json!(1);

    let err = codec.encode_args(&sig, &[ArgSlot::Value(&only)]).unwrap_err();
    assert_eq!(err, Error::ArgumentCount { method: "get".into(), expected: 2, found: 1 });
}

#[test]
fn test_argument_kind_mismatch() {
    let codec = JsonSerialization::new();
    let sig = MethodSignature::new("upload", vec![ParamKind::Stream], ReturnKind::Value);
    let not_a_stream = json!("oops");

    let err = codec.encode_args(&sig, &[ArgSlot::Value(&not_a_stream)]).unwrap_err();
    assert_eq!(err, Error::ArgumentKind { method: "upload".into(), index: 0, expected: ParamKind::Stream });
}

#[test]
fn test_hand_written_marker_in_value_argument_is_rejected() {
    let codec = JsonSerialization::new();
    let sig = MethodSignature::values("put", 1);
    let sneaky = json!({ "x": stream_marker(StreamId(3)) });

    let err = codec.encode_args(&sig, &[ArgSlot::Value(&sneaky)]).unwrap_err();
    assert_eq!(err, Error::UnknownStream(StreamId(3)));
}

#[test]
fn test_marker_without_descriptor_is_rejected() {
    let codec = JsonSerialization::new();
    let payload = Payload {
        data: serde_json::to_vec(&stream_marker(StreamId(9))).unwrap(),
        streams: Vec::new(),
    };
    assert_eq!(codec.decode_value(&payload).unwrap_err(), Error::UnknownStream(StreamId(9)));
}

#[test]
fn test_descriptor_without_marker_is_rejected() {
    let codec = JsonSerialization::new();
    let err = codec.encode_value(&json!(1), vec![StreamRef::new(StreamId(4), "ghost")]).unwrap_err();
    assert_eq!(err, Error::UnreferencedStream(StreamId(4)));
}

#[test]
fn test_malformed_bytes_are_a_serialization_error() {
    let codec = JsonSerialization::new();
    let payload = Payload { data: b"{not json".to_vec(), streams: Vec::new() };
    assert!(matches!(codec.decode_value(&payload), Err(Error::Serialization(_))));
}

#[test]
fn test_decode_handle() -> Result<()> {
    let codec = JsonSerialization::new();
    let payload = codec.encode_value(&json!("files/42"), Vec::new())?;
    assert_eq!(codec.decode_handle(&payload)?, ServiceId::new("files/42"));

    let bad = codec.encode_value(&json!(42), Vec::new())?;
    assert!(matches!(codec.decode_handle(&bad), Err(Error::InvalidHandle(_))));
    Ok(())
}

// ============================================================================
//  MESSAGES
// ============================================================================

#[test]
fn test_message_correlation_helpers() {
    let cancel = Message::CancelCall { request_id: RequestId(5) };
    assert_eq!(cancel.request_id(), Some(RequestId(5)));
    assert_eq!(cancel.stream_id(), None);
    assert_eq!(cancel.name(), "CancelCall");

    let next = Message::StreamNext { stream_id: StreamId(8), credit: 3 };
    assert_eq!(next.stream_id(), Some(StreamId(8)));
    assert_eq!(next.request_id(), None);
}

#[test]
fn test_envelope_serde_roundtrip() {
    let envelope = Envelope::new(
        RouteId::new("server"),
        RouteId::new("client"),
        Message::CallFailure {
            request_id: RequestId(1),
            error: FailureInfo::new(FailureKind::ServiceNotReady, "warming up").with_details(json!({"eta": 3})),
        },
    );

    let text = serde_json::to_string(&envelope).unwrap();
    let back: Envelope = serde_json::from_str(&text).unwrap();
    assert_eq!(back, envelope);
}
