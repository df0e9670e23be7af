use bytes::Bytes;
use serde_json::json;

use crate::*;

// ============================================================================
//  FRAMES
// ============================================================================

fn sample_request(id: CallId) -> CallRequest {
    let codec = JsonCodec;
    CallRequest {
        id,
        channel: Channel::Service,
        method: "Add".into(),
        args: vec![
            Bytes::from(codec.encode_value(&json!(2)).unwrap()),
            Bytes::from(codec.encode_value(&json!(3)).unwrap()),
        ],
        witnesses: vec!["i32".into(), "list<string>".into()],
    }
}

#[test]
fn test_request_frame_roundtrip() {
    let frame = Frame::Request(sample_request(u64::MAX - 7));
    let bytes = frame.encode().expect("encode failed");

    assert_eq!(bytes[0], 0x01);
    assert_eq!(peek_call_id(&bytes).unwrap(), u64::MAX - 7);

    let decoded = Frame::decode(bytes).expect("decode failed");
    assert_eq!(decoded, frame);
}

#[test]
fn test_response_frames_keep_call_id() {
    let ok = Frame::Response(CallResponse::success(42, b"5".to_vec()));
    let err = Frame::Response(CallResponse::failure(43, "method not found: Foo"));

    for frame in [ok, err] {
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(bytes).unwrap();
        assert_eq!(decoded.id(), frame.id());
        assert_eq!(decoded, frame);
    }
}

#[test]
fn test_failure_text_survives_unicode() {
    let frame = Frame::Response(CallResponse::failure(1, "échec: ☃"));
    let decoded = Frame::decode(frame.encode().unwrap()).unwrap();
    let Frame::Response(resp) = decoded else { panic!("expected response") };
    assert_eq!(resp.outcome, Err("échec: ☃".to_string()));
}

#[test]
fn test_truncated_frame_is_rejected() {
    let bytes = Frame::Request(sample_request(9)).encode().unwrap();
    for cut in [0, 1, 5, 9, 12, bytes.len() - 1] {
        let result = Frame::decode(bytes.slice(..cut));
        assert!(
            matches!(result, Err(Error::UnexpectedEnd { .. })),
            "cut at {} gave {:?}",
            cut,
            result
        );
    }
}

#[test]
fn test_trailing_bytes_are_rejected() {
    let mut raw = Frame::Response(CallResponse::success(1, b"null".to_vec()))
        .encode()
        .unwrap()
        .to_vec();
    raw.push(0xFF);
    assert_eq!(Frame::decode(Bytes::from(raw)), Err(Error::TrailingBytes(1)));
}

#[test]
fn test_unknown_kind_and_channel() {
    assert_eq!(Frame::decode(Bytes::from_static(&[0x7F])), Err(Error::UnknownFrameKind(0x7F)));

    let mut raw = Frame::Request(sample_request(1)).encode().unwrap().to_vec();
    raw[9] = 9; // channel byte follows kind + id
    assert_eq!(Frame::decode(Bytes::from(raw)), Err(Error::UnknownChannel(9)));
}

#[test]
fn test_huge_count_does_not_allocate() {
    let mut raw = vec![0x01];
    raw.extend_from_slice(&1u64.to_le_bytes());
    raw.push(0);
    raw.extend_from_slice(&0u32.to_le_bytes()); // empty method
    raw.extend_from_slice(&u32::MAX.to_le_bytes()); // argc
    assert!(matches!(
        Frame::decode(Bytes::from(raw)),
        Err(Error::UnexpectedEnd { field: "argument count" })
    ));
}

#[test]
fn test_channel_reverse() {
    assert_eq!(Channel::Service.reverse(), Channel::Callback);
    assert_eq!(Channel::Callback.reverse(), Channel::Service);
}

// ============================================================================
//  TYPE DESCRIPTORS
// ============================================================================

#[test]
fn test_type_desc_parse_and_display() {
    let cases = [
        ("i32", TypeDesc::I32),
        ("int", TypeDesc::I32),
        ("list<string>", TypeDesc::list(TypeDesc::String)),
        ("option< list<u64> >", TypeDesc::option(TypeDesc::list(TypeDesc::U64))),
        ("map<f64>", TypeDesc::map(TypeDesc::F64)),
        ("tuple<i64, bool>", TypeDesc::Tuple(vec![TypeDesc::I64, TypeDesc::Bool])),
        ("geo.v1/Point", TypeDesc::named("geo.v1/Point")),
    ];

    for (text, expected) in cases {
        let parsed: TypeDesc = text.parse().unwrap_or_else(|e| panic!("{}: {}", text, e));
        assert_eq!(parsed, expected);
        // canonical form parses back to the same descriptor
        assert_eq!(parsed.to_string().parse::<TypeDesc>().unwrap(), expected);
    }

    assert_eq!(TypeDesc::Tuple(vec![TypeDesc::I64, TypeDesc::Bool]).to_string(), "tuple<i64,bool>");
}

#[test]
fn test_type_desc_rejects_garbage() {
    for text in ["", "list", "list<>", "list<i32", "map<i32,i32>", "Point<i32>", "i32 x", "<i32>"] {
        assert!(text.parse::<TypeDesc>().is_err(), "{:?} should not parse", text);
    }
}

#[test]
fn test_type_desc_nesting_is_bounded() {
    let nested = |depth: usize| format!("{}i32{}", "list<".repeat(depth - 1), ">".repeat(depth - 1));
    assert!(nested(MAX_TYPE_DEPTH).parse::<TypeDesc>().is_ok());

    match nested(MAX_TYPE_DEPTH + 1).parse::<TypeDesc>() {
        Err(Error::InvalidTypeDesc { reason, .. }) => assert!(reason.contains("nesting"), "{}", reason),
        other => panic!("expected nesting error, got {:?}", other),
    }

    // Far past the limit: must fail cleanly rather than exhaust the stack.
    let hostile = format!("{}i32{}", "list<".repeat(200_000), ">".repeat(200_000));
    match hostile.parse::<TypeDesc>() {
        // The echoed input is clipped, not the whole string.
        Err(Error::InvalidTypeDesc { input, .. }) => assert!(input.len() < 100, "{}", input.len()),
        other => panic!("expected nesting error, got {:?}", other),
    }
}

#[test]
fn test_to_wire_refuses_names_that_do_not_read_back() {
    assert_eq!(TypeDesc::list(TypeDesc::named("geo/Point")).to_wire().unwrap(), "list<geo/Point>");
    assert_eq!(TypeDesc::Tuple(vec![TypeDesc::I32, TypeDesc::Bool]).to_wire().unwrap(), "tuple<i32,bool>");

    for name in ["list", "int", "", "a b", "x<y>"] {
        let ty = TypeDesc::option(TypeDesc::named(name));
        assert!(
            matches!(ty.to_wire(), Err(Error::InvalidTypeDesc { .. })),
            "{:?} should be refused",
            name
        );
    }
}

#[test]
fn test_witness_text_is_not_parsed_by_frame_decode() {
    let mut req = sample_request(5);
    req.witnesses = vec!["list".into(), "not a type".into()];
    let frame = Frame::Request(req);
    let decoded = Frame::decode(frame.encode().unwrap()).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn test_generic_substitution() {
    let params = vec!["T".to_string(), "U".to_string()];
    let witnesses = vec![TypeDesc::I32, TypeDesc::String];

    let declared = TypeDesc::Tuple(vec![
        TypeDesc::named("T"),
        TypeDesc::list(TypeDesc::named("U")),
        TypeDesc::named("Point"),
    ]);
    assert_eq!(
        declared.substitute(&params, &witnesses),
        TypeDesc::Tuple(vec![TypeDesc::I32, TypeDesc::list(TypeDesc::String), TypeDesc::named("Point")])
    );

    // unbound parameters stay symbolic
    assert_eq!(TypeDesc::named("U").substitute(&params, &witnesses[..1]), TypeDesc::named("U"));
}

#[test]
fn test_value_kind() {
    assert_eq!(value_kind(&json!(null)), "null");
    assert_eq!(value_kind(&json!(1)), "integer");
    assert_eq!(value_kind(&json!(1.5)), "float");
    assert_eq!(value_kind(&json!("x")), "string");
    assert_eq!(value_kind(&json!([1])), "list");
    assert_eq!(value_kind(&json!({"a": 1})), "map");
}

// ============================================================================
//  CONVERSION
// ============================================================================

#[test]
fn test_numeric_string_converts_to_int() {
    let out = StandardConverter.convert(json!("5"), &TypeDesc::I32).unwrap();
    assert_eq!(out, json!(5));
    assert_eq!(from_value::<i32>(out).unwrap(), 5);

    assert_eq!(StandardConverter.convert(json!(" -12 "), &TypeDesc::I64).unwrap(), json!(-12));
    assert_eq!(StandardConverter.convert(json!(7.0), &TypeDesc::U32).unwrap(), json!(7));
}

#[test]
fn test_integer_range_and_fraction_are_enforced() {
    let conv = StandardConverter;
    assert!(conv.convert(json!(2.5), &TypeDesc::I32).is_err());
    assert!(conv.convert(json!(-1), &TypeDesc::U64).is_err());
    assert!(conv.convert(json!(i64::MAX), &TypeDesc::I32).is_err());
    assert!(conv.convert(json!(u64::MAX), &TypeDesc::U64).is_ok());
    assert!(conv.convert(json!("five"), &TypeDesc::I32).is_err());
}

#[test]
fn test_scalar_coercions() {
    let conv = StandardConverter;
    assert_eq!(conv.convert(json!("TRUE"), &TypeDesc::Bool).unwrap(), json!(true));
    assert_eq!(conv.convert(json!(3), &TypeDesc::String).unwrap(), json!("3"));
    assert_eq!(conv.convert(json!("2.5"), &TypeDesc::F64).unwrap(), json!(2.5));
    assert_eq!(conv.convert(json!("x"), &TypeDesc::Char).unwrap(), json!("x"));
    assert!(conv.convert(json!("xy"), &TypeDesc::Char).is_err());
    assert!(conv.convert(json!(0), &TypeDesc::Unit).is_err());
}

#[test]
fn test_container_conversion_reports_path() {
    let conv = StandardConverter;
    let ty = TypeDesc::map(TypeDesc::list(TypeDesc::I32));

    let ok = conv.convert(json!({"a": ["1", 2]}), &ty).unwrap();
    assert_eq!(ok, json!({"a": [1, 2]}));

    let err = conv.convert(json!({"a": [1, "nope"]}), &ty).unwrap_err();
    assert_eq!(err.expected, TypeDesc::I32);
    assert_eq!(err.actual, "string");
    assert_eq!(err.path, ".a[1]");
    assert_eq!(err.to_string(), "expected i32, found string at .a[1]");
}

#[test]
fn test_option_tuple_and_passthrough() {
    let conv = StandardConverter;
    let opt = TypeDesc::option(TypeDesc::U32);
    assert_eq!(conv.convert(json!(null), &opt).unwrap(), json!(null));
    assert_eq!(conv.convert(json!("4"), &opt).unwrap(), json!(4));

    let tuple = TypeDesc::Tuple(vec![TypeDesc::String, TypeDesc::Bool]);
    assert_eq!(conv.convert(json!([1, "false"]), &tuple).unwrap(), json!(["1", false]));
    assert!(conv.convert(json!([1]), &tuple).is_err());

    let point = json!({"x": 1, "y": "2"});
    assert_eq!(conv.convert(point.clone(), &TypeDesc::named("Point")).unwrap(), point);
    assert_eq!(conv.convert(point.clone(), &TypeDesc::Any).unwrap(), point);
}

#[test]
fn test_json_codec_rejects_garbage() {
    let codec = JsonCodec;
    assert!(matches!(codec.decode_value(b"{not json"), Err(Error::Codec(_))));
    let bytes = codec.encode_value(&json!({"k": [1, 2]})).unwrap();
    assert_eq!(codec.decode_value(&bytes).unwrap(), json!({"k": [1, 2]}));
}
