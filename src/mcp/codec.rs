//! Wire codec: typed messages to and from JSON-RPC bytes
//!
//! Classification follows the envelope fields: `method` without `id` is a
//! notification, `id` with `method` a request, `id` without `method` a
//! response. A notification's `related_request_id` rides in
//! `params._meta.relatedRequestId`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::protocol::{
    ErrorObject, Message, Notification, Request, RequestId, Response, JSONRPC_VERSION,
};
use crate::error::{RelayError, Result};

const META_KEY: &str = "_meta";
const RELATED_REQUEST_KEY: &str = "relatedRequestId";

/// JSON-RPC envelope as it appears on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(default)]
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

impl From<&Message> for Envelope {
    fn from(msg: &Message) -> Self {
        let mut env = Envelope {
            jsonrpc: JSONRPC_VERSION.to_string(),
            ..Default::default()
        };
        match msg {
            Message::Request(req) => {
                env.id = Some(req.id.clone());
                env.method = Some(req.method.clone());
                env.params = non_null(req.params.clone());
            }
            Message::Response(resp) => {
                env.id = Some(resp.id.clone());
                match &resp.outcome {
                    Ok(result) => env.result = Some(result.clone()),
                    Err(error) => env.error = Some(error.clone()),
                }
            }
            Message::Notification(n) => {
                env.method = Some(n.method.clone());
                let mut params = n.params.clone();
                if let Some(related) = &n.related_request_id {
                    attach_related(&mut params, related);
                }
                env.params = non_null(params);
            }
        }
        env
    }
}

impl TryFrom<Envelope> for Message {
    type Error = RelayError;

    fn try_from(env: Envelope) -> Result<Self> {
        if env.jsonrpc != JSONRPC_VERSION {
            return Err(RelayError::Protocol(format!(
                "invalid jsonrpc version '{}'",
                env.jsonrpc
            )));
        }
        let params = env.params.unwrap_or(Value::Null);
        match (env.id, env.method) {
            (Some(id), Some(method)) => Ok(Message::Request(Request { id, method, params })),
            (None, Some(method)) => {
                let mut params = params;
                let related_request_id = detach_related(&mut params);
                Ok(Message::Notification(Notification {
                    method,
                    params,
                    related_request_id,
                }))
            }
            (Some(id), None) => {
                let outcome = match (env.result, env.error) {
                    (Some(result), None) => Ok(result),
                    (None, Some(error)) => Err(error),
                    (Some(_), Some(_)) => {
                        return Err(RelayError::Protocol(format!(
                            "response {} carries both result and error",
                            id
                        )))
                    }
                    (None, None) => {
                        return Err(RelayError::Protocol(format!(
                            "response {} carries neither result nor error",
                            id
                        )))
                    }
                };
                Ok(Message::Response(Response { id, outcome }))
            }
            (None, None) => Err(RelayError::Protocol(
                "message has neither id nor method".to_string(),
            )),
        }
    }
}

fn non_null(value: Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

fn attach_related(params: &mut Value, related: &RequestId) {
    if params.is_null() {
        *params = Value::Object(Map::new());
    }
    if let Value::Object(map) = params {
        let meta = map
            .entry(META_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = meta {
            meta.insert(
                RELATED_REQUEST_KEY.to_string(),
                serde_json::to_value(related).unwrap_or(Value::Null),
            );
        }
    }
}

fn detach_related(params: &mut Value) -> Option<RequestId> {
    let map = params.as_object_mut()?;
    let meta = map.get_mut(META_KEY)?.as_object_mut()?;
    let related = meta.remove(RELATED_REQUEST_KEY)?;
    if meta.is_empty() {
        map.remove(META_KEY);
    }
    serde_json::from_value(related).ok()
}

/// Convert a message into its JSON value form
pub fn to_value(msg: &Message) -> Value {
    serde_json::to_value(Envelope::from(msg)).unwrap_or(Value::Null)
}

/// Classify a JSON value as a message
pub fn from_value(value: Value) -> Result<Message> {
    let env: Envelope = serde_json::from_value(value)
        .map_err(|e| RelayError::Protocol(format!("malformed message: {}", e)))?;
    Message::try_from(env)
}

/// Encode a message as a single-line JSON document
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&Envelope::from(msg))?)
}

/// Decode a single message
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| RelayError::Protocol(format!("parse error: {}", e)))?;
    from_value(value)
}

/// Decode a body that is either one message or a JSON array of messages
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Message>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| RelayError::Protocol(format!("parse error: {}", e)))?;
    match value {
        Value::Array(items) => items.into_iter().map(from_value).collect(),
        single => Ok(vec![from_value(single)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::methods;
    use serde_json::json;

    #[test]
    fn test_classification() {
        let req = decode(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(matches!(req, Message::Request(ref r) if r.params.is_null()));

        let note =
            decode(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert_eq!(note.kind(), "notification");

        let resp = decode(br#"{"jsonrpc":"2.0","id":"a","result":{}}"#).unwrap();
        match resp {
            Message::Response(r) => assert_eq!(r.id, RequestId::String("a".into())),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_response_needs_exactly_one_payload() {
        let both = decode(
            br#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#,
        );
        assert!(matches!(both, Err(RelayError::Protocol(_))));
        let neither = decode(br#"{"jsonrpc":"2.0","id":1}"#);
        assert!(matches!(neither, Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(RelayError::Protocol(_))));
        assert!(matches!(
            decode(br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#),
            Err(RelayError::Protocol(_))
        ));
        assert!(matches!(
            decode(br#"{"jsonrpc":"2.0"}"#),
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn test_related_request_id_travels_in_meta() {
        let note = Notification::new(
            methods::LOG_MESSAGE,
            json!({"level": "info", "data": "subscribe_resource"}),
        )
        .related_to(RequestId::Number(4));
        let value = to_value(&Message::Notification(note.clone()));
        assert_eq!(value["params"]["_meta"]["relatedRequestId"], json!(4));

        let back = from_value(value).unwrap();
        assert_eq!(back, Message::Notification(note));
    }

    #[test]
    fn test_decode_batch() {
        let msgs = decode_batch(
            br#"[{"jsonrpc":"2.0","method":"notifications/message","params":{"data":"x"}},
                 {"jsonrpc":"2.0","id":2,"result":{"ok":true}}]"#,
        )
        .unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].kind(), "response");

        let single = decode_batch(br#"{"jsonrpc":"2.0","id":2,"result":{}}"#).unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn test_encoded_form_is_single_line() {
        let msg = Message::Request(Request::new(
            1,
            methods::CALL_TOOL,
            json!({"name": "fetch", "arguments": {"url": "https://example.com"}}),
        ));
        let bytes = encode(&msg).unwrap();
        assert!(!bytes.contains(&b'\n'));
        assert_eq!(decode(&bytes).unwrap(), msg);
    }
}
