//! JSON text frames exchanged over the socket.
//!
//! Outbound: `{"id", "capability", "params", "streaming"}` or, with JSON-RPC
//! framing, `{"jsonrpc": "2.0", "id", "method", "params"}`.
//!
//! Inbound frames are routed by `id` and classified by their members, checked
//! in this order: `error`, `chunk`, `result`, then a completion marker
//! (`"complete": true` or `"type": "complete"`).

use agent_primitives::{CapabilityRequest, CapabilityResponse, RemoteError, RequestId, ResponsePayload};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotObject,
    #[error("frame has no usable id")]
    MissingId,
    #[error("frame carries no result, chunk, error or completion marker")]
    Unrecognised,
}

/// Serializes `request` into a text frame. `extra` members are merged first so
/// they can never replace the fields that route the call.
pub(crate) fn encode_request(
    request: &CapabilityRequest,
    json_rpc: bool,
    extra: &Map<String, Value>,
) -> Result<String, serde_json::Error> {
    let mut frame = extra.clone();

    if json_rpc {
        frame.insert("jsonrpc".into(), Value::from("2.0"));
        frame.insert("method".into(), Value::from(request.capability().as_str()));
    } else {
        frame.insert(
            "capability".into(),
            Value::from(request.capability().as_str()),
        );
    }
    frame.insert("id".into(), Value::from(request.id().as_str()));
    frame.insert("params".into(), Value::Object(request.params().clone()));
    if request.is_streaming() || !json_rpc {
        frame.insert("streaming".into(), Value::Bool(request.is_streaming()));
    }

    serde_json::to_string(&Value::Object(frame))
}

pub(crate) fn decode_response(text: &str) -> Result<CapabilityResponse, FrameError> {
    let Value::Object(mut frame) = serde_json::from_str::<Value>(text)? else {
        return Err(FrameError::NotObject);
    };

    let id = match frame.get("id") {
        Some(Value::String(id)) if !id.is_empty() => RequestId::from(id.as_str()),
        Some(Value::Number(id)) => RequestId::from(id.to_string()),
        _ => return Err(FrameError::MissingId),
    };

    let payload = if let Some(error) = frame.get("error").filter(|error| !error.is_null()) {
        ResponsePayload::Error(RemoteError::from_value(error))
    } else if let Some(chunk) = frame.remove("chunk") {
        ResponsePayload::Chunk(chunk)
    } else if let Some(result) = frame.remove("result") {
        ResponsePayload::Result(result)
    } else if is_completion(&frame) {
        ResponsePayload::Complete
    } else {
        return Err(FrameError::Unrecognised);
    };

    Ok(CapabilityResponse::new(id, payload))
}

fn is_completion(frame: &Map<String, Value>) -> bool {
    frame.get("complete").and_then(Value::as_bool) == Some(true)
        || frame.get("type").and_then(Value::as_str) == Some("complete")
}

#[cfg(test)]
mod tests {
    use agent_primitives::CapabilityName;
    use serde_json::json;

    use super::*;

    fn request(streaming: bool) -> CapabilityRequest {
        CapabilityRequest::builder(CapabilityName::new("generate").unwrap())
            .id(RequestId::from("req-1"))
            .param("prompt", "hi")
            .streaming(streaming)
            .build()
            .unwrap()
    }

    #[test]
    fn plain_frame_shape() {
        let text = encode_request(&request(true), false, &Map::new()).unwrap();
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            frame,
            json!({
                "id": "req-1",
                "capability": "generate",
                "params": {"prompt": "hi"},
                "streaming": true
            })
        );
    }

    #[test]
    fn json_rpc_frame_shape() {
        let text = encode_request(&request(false), true, &Map::new()).unwrap();
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            frame,
            json!({"jsonrpc": "2.0", "id": "req-1", "method": "generate", "params": {"prompt": "hi"}})
        );
    }

    #[test]
    fn extra_members_never_override_routing_fields() {
        let extra = json!({"id": "spoofed", "session": "s-9"});
        let Value::Object(extra) = extra else {
            unreachable!()
        };
        let text = encode_request(&request(false), false, &extra).unwrap();
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["id"], "req-1");
        assert_eq!(frame["session"], "s-9");
    }

    #[test]
    fn classification_precedence() {
        let error = decode_response(r#"{"id":"a","error":{"message":"boom"},"result":1}"#).unwrap();
        assert!(matches!(error.payload(), ResponsePayload::Error(e) if e.message() == "boom"));

        let chunk = decode_response(r#"{"id":"a","chunk":{"t":"x"},"result":null}"#).unwrap();
        assert_eq!(chunk.payload(), &ResponsePayload::Chunk(json!({"t": "x"})));

        let result = decode_response(r#"{"id":"a","result":null,"error":null}"#).unwrap();
        assert_eq!(result.payload(), &ResponsePayload::Result(Value::Null));

        let complete = decode_response(r#"{"id":"a","type":"complete"}"#).unwrap();
        assert_eq!(complete.payload(), &ResponsePayload::Complete);
        let complete = decode_response(r#"{"id":"a","complete":true}"#).unwrap();
        assert!(complete.payload().is_terminal());
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let response = decode_response(r#"{"id":42,"result":"ok"}"#).unwrap();
        assert_eq!(response.id().as_str(), "42");
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(decode_response("not json"), Err(FrameError::Json(_))));
        assert!(matches!(decode_response("[1,2]"), Err(FrameError::NotObject)));
        assert!(matches!(decode_response(r#"{"result":1}"#), Err(FrameError::MissingId)));
        assert!(matches!(decode_response(r#"{"id":"a","status":"ok"}"#), Err(FrameError::Unrecognised)));
    }
}
