//! Wire-level tests: classification, command parsing, envelopes, ids.

use serde_json::json;

use crate::Command;
use crate::Envelope;
use crate::ErrorObject;
use crate::Message;
use crate::Request;
use crate::RequestId;
use crate::Response;
use crate::WireError;
use crate::COMMAND_CHANNEL;
use crate::SNAP_ERROR;

#[test]
fn classify_request() {
    let value = json!({
        "jsonrpc": "2.0",
        "id": "abc",
        "method": "ping",
    });

    let message = Message::classify(value).expect("Failed to classify");
    match message {
        Message::Request(req) => {
            assert_eq!(req.method, "ping");
            assert_eq!(req.id, Some(RequestId::Str("abc".into())));
        }
        _ => panic!("Expected Request"),
    }
}

#[test]
fn classify_response_with_numeric_id() {
    let value = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "result": "OK",
    });

    let message = Message::classify(value).expect("Failed to classify");
    match message {
        Message::Response(resp) => {
            assert_eq!(resp.id, Some(RequestId::Num(7)));
            assert_eq!(resp.result, Some(json!("OK")));
            assert!(!resp.is_out_of_band());
        }
        _ => panic!("Expected Response"),
    }
}

#[test]
fn classify_rejects_non_objects() {
    let err = Message::classify(json!("hello")).unwrap_err();
    match err {
        WireError::NotAnObject => {}
        _ => panic!("Expected NotAnObject, got {:?}", err),
    }

    let err = Message::classify(json!(42)).unwrap_err();
    match err {
        WireError::NotAnObject => {}
        _ => panic!("Expected NotAnObject, got {:?}", err),
    }
}

#[test]
fn classify_rejects_arrays() {
    let err = Message::classify(json!([{"method": "ping"}])).unwrap_err();
    match err {
        WireError::ArrayMessage => {}
        _ => panic!("Expected ArrayMessage, got {:?}", err),
    }
}

#[test]
fn classify_rejects_shapeless_objects() {
    let err = Message::classify(json!({"hello": "world"})).unwrap_err();
    match err {
        WireError::UnknownShape => {}
        _ => panic!("Expected UnknownShape, got {:?}", err),
    }
}

#[test]
fn id_less_error_is_out_of_band() {
    let value = json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": -32000, "message": "boom"},
    });

    let message = Message::classify(value).expect("Failed to classify");
    match message {
        Message::Response(resp) => {
            assert!(resp.is_out_of_band());
            assert_eq!(resp.error.unwrap().message, "boom");
        }
        _ => panic!("Expected Response"),
    }
}

#[test]
fn parse_ping_ignores_params() {
    let request = Request::new(RequestId::fresh(), "ping", Some(json!({"extra": true})));
    let command = Command::from_request(&request).expect("Failed to parse");
    match command {
        Command::Ping => {}
        _ => panic!("Expected Ping"),
    }
}

#[test]
fn parse_execute_snap() {
    let request = Request::new(
        RequestId::fresh(),
        "executeSnap",
        Some(json!({"snapId": "snap-a", "sourceCode": "(module)"})),
    );

    let command = Command::from_request(&request).expect("Failed to parse");
    match command {
        Command::ExecuteSnap(params) => {
            assert_eq!(params.snap_id.as_str(), "snap-a");
            assert_eq!(params.source_code, "(module)");
        }
        _ => panic!("Expected ExecuteSnap"),
    }
}

#[test]
fn parse_execute_snap_bad_params() {
    let request = Request::new(
        RequestId::fresh(),
        "executeSnap",
        Some(json!({"snapId": "snap-a"})),
    );

    let err = Command::from_request(&request).unwrap_err();
    match err {
        WireError::InvalidParams { method, .. } => assert_eq!(method, "executeSnap"),
        _ => panic!("Expected InvalidParams, got {:?}", err),
    }
}

#[test]
fn parse_snap_rpc() {
    let request = Request::new(
        RequestId::fresh(),
        "snapRpc",
        Some(json!({
            "origin": "https://dapp.example",
            "request": {"method": "hello"},
            "target": "snap-a",
        })),
    );

    let command = Command::from_request(&request).expect("Failed to parse");
    match command {
        Command::SnapRpc(params) => {
            assert_eq!(params.origin, "https://dapp.example");
            assert_eq!(params.target.as_str(), "snap-a");
            assert_eq!(params.request, json!({"method": "hello"}));
        }
        _ => panic!("Expected SnapRpc"),
    }
}

#[test]
fn unknown_method_is_a_variant() {
    let request = Request::new(RequestId::fresh(), "mintGold", None);
    let command = Command::from_request(&request).expect("Failed to parse");
    match command {
        Command::Unrecognized(method) => assert_eq!(method, "mintGold"),
        _ => panic!("Expected Unrecognized"),
    }
}

#[test]
fn command_round_trips_through_request() {
    let command = Command::SnapRpc(crate::SnapRpcParams {
        origin: "origin1".into(),
        request: json!({"method": "hello"}),
        target: "snap-a".into(),
    });

    let request = command.into_request(RequestId::fresh());
    assert_eq!(request.method, "snapRpc");

    let reparsed = Command::from_request(&request).expect("Failed to reparse");
    match reparsed {
        Command::SnapRpc(params) => assert_eq!(params.origin, "origin1"),
        _ => panic!("Expected SnapRpc"),
    }
}

#[test]
fn envelope_round_trip() {
    let envelope = Envelope::new(COMMAND_CHANNEL, json!({"method": "ping"}));
    let bytes = envelope.to_bytes().expect("Failed to encode");
    let decoded = Envelope::from_bytes(&bytes).expect("Failed to decode");

    assert_eq!(decoded.channel, COMMAND_CHANNEL);
    assert_eq!(decoded.payload, json!({"method": "ping"}));
}

#[test]
fn envelope_rejects_garbage() {
    let err = Envelope::from_bytes(&[0xFF, 0xFF, 0xFF]).unwrap_err();
    match err {
        WireError::Json(_) => {}
        _ => panic!("Expected Json, got {:?}", err),
    }
}

#[test]
fn fresh_ids_do_not_collide() {
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        assert!(seen.insert(RequestId::fresh()));
    }
}

#[test]
fn error_object_display_is_the_message() {
    let error = ErrorObject::new(SNAP_ERROR, "handler rejected");
    assert_eq!(error.to_string(), "handler rejected");
}

#[test]
fn response_serializes_null_id() {
    let response = Response {
        jsonrpc: "2.0".into(),
        id: None,
        result: None,
        error: Some(ErrorObject::new(SNAP_ERROR, "x")),
    };

    let value = serde_json::to_value(&response).expect("Failed to encode");
    assert_eq!(value["id"], serde_json::Value::Null);
    assert!(value.get("result").is_none());
}
