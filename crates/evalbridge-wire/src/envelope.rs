//! Bridge envelopes as bencode dicts.
//!
//! A dict carrying a `status` key is a response; anything else is a request.

use crate::bencode::WireValue;
use crate::frame::WireError;
use evalbridge_types::envelope::{
    Direction, Envelope, Payload, RequestEnvelope, ResponseEnvelope, ResponseStatus,
};
use evalbridge_types::error::BridgeError;

/// Encode an envelope as a wire dict.
pub fn to_wire(envelope: &Envelope) -> WireValue {
    match envelope {
        Envelope::Request(req) => request_to_wire(req),
        Envelope::Response(resp) => response_to_wire(resp),
    }
}

fn request_to_wire(req: &RequestEnvelope) -> WireValue {
    let code = match &req.code {
        Payload::Text(text) => WireValue::from(text.as_str()),
        Payload::Args(args) => WireValue::from(args.clone()),
    };
    WireValue::dict([
        ("id", WireValue::from(req.id.as_str())),
        ("direction", WireValue::from(req.direction.as_str())),
        ("op", WireValue::from(req.op.as_str())),
        ("code", code),
        ("timestamp", WireValue::Int(req.timestamp as i64)),
    ])
}

fn response_to_wire(resp: &ResponseEnvelope) -> WireValue {
    let mut dict = WireValue::dict([
        ("id", WireValue::from(resp.id.as_str())),
        ("status", WireValue::from(resp.status.as_str())),
    ]);
    if let Some(value) = &resp.value {
        dict.insert("value", WireValue::from(value.as_str()));
    }
    if let Some(error) = &resp.error {
        dict.insert("error", WireValue::from(error.as_str()));
    }
    if let Some(ms) = resp.execution_time_ms {
        dict.insert("execution-time-ms", WireValue::Int(ms as i64));
    }
    dict
}

/// Decode a wire dict into an envelope.
pub fn from_wire(value: &WireValue) -> Result<Envelope, WireError> {
    if value.as_dict().is_none() {
        return Err(malformed("envelope is not a dict"));
    }
    let id = required_str(value, "id")?.to_string();
    match value.get("status") {
        Some(status) => {
            let status: ResponseStatus = status
                .as_str()
                .ok_or_else(|| malformed("status is not a string"))?
                .parse()
                .map_err(|e: BridgeError| malformed(&e.to_string()))?;
            Ok(Envelope::Response(ResponseEnvelope {
                id,
                status,
                value: optional_str(value, "value")?,
                error: optional_str(value, "error")?,
                execution_time_ms: optional_u64(value, "execution-time-ms")?,
            }))
        }
        None => {
            let direction: Direction = required_str(value, "direction")?
                .parse()
                .map_err(|e: BridgeError| malformed(&e.to_string()))?;
            let op = required_str(value, "op")?.to_string();
            let code = match value.get("code") {
                None => Payload::Text(String::new()),
                Some(WireValue::List(items)) => Payload::Args(
                    items
                        .iter()
                        .map(|item| {
                            item.as_str()
                                .map(String::from)
                                .ok_or_else(|| malformed("code list holds a non-string"))
                        })
                        .collect::<Result<_, _>>()?,
                ),
                Some(other) => Payload::Text(
                    other
                        .as_str()
                        .ok_or_else(|| malformed("code is neither text nor a list"))?
                        .to_string(),
                ),
            };
            Ok(Envelope::Request(RequestEnvelope {
                id,
                direction,
                op,
                code,
                timestamp: optional_u64(value, "timestamp")?.unwrap_or(0),
            }))
        }
    }
}

fn malformed(msg: &str) -> WireError {
    WireError::MalformedFrame(format!("bad envelope: {msg}"))
}

fn required_str<'a>(value: &'a WireValue, key: &str) -> Result<&'a str, WireError> {
    value
        .get_str(key)
        .ok_or_else(|| malformed(&format!("missing or non-text '{key}'")))
}

fn optional_str(value: &WireValue, key: &str) -> Result<Option<String>, WireError> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| malformed(&format!("'{key}' is not text"))),
    }
}

fn optional_u64(value: &WireValue, key: &str) -> Result<Option<u64>, WireError> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_int()
            .and_then(|n| u64::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| malformed(&format!("'{key}' is not a non-negative integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{decode, encode};
    use evalbridge_types::envelope::OperationKind;

    #[test]
    fn test_request_through_bytes() {
        let req = RequestEnvelope::new(
            "X",
            Direction::ToLocal,
            OperationKind::Shell,
            vec!["echo".to_string(), "hi".to_string()],
        );
        let bytes = encode(&to_wire(&Envelope::Request(req.clone())));
        let back = from_wire(&decode(&bytes).unwrap()).unwrap();
        assert_eq!(back, Envelope::Request(req));
    }

    #[test]
    fn test_response_optional_fields() {
        let resp = ResponseEnvelope::error("e-1", "boom");
        let wire = to_wire(&Envelope::Response(resp.clone()));
        assert_eq!(wire.get_str("status"), Some("error"));
        assert!(wire.get("value").is_none());
        assert_eq!(from_wire(&wire).unwrap(), Envelope::Response(resp));
    }

    #[test]
    fn test_unknown_op_survives_decoding() {
        let wire = WireValue::dict([
            ("id", WireValue::from("D")),
            ("direction", WireValue::from("to-local")),
            ("op", WireValue::from("frobnicate")),
            ("code", WireValue::from("")),
        ]);
        match from_wire(&wire).unwrap() {
            Envelope::Request(req) => {
                assert_eq!(req.op, "frobnicate");
                assert!(req.kind().is_err());
            }
            other => panic!("Expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_envelopes() {
        let no_id = WireValue::dict([("direction", WireValue::from("to-local"))]);
        assert!(from_wire(&no_id).is_err());

        let bad_direction = WireValue::dict([
            ("id", WireValue::from("1")),
            ("direction", WireValue::from("upward")),
            ("op", WireValue::from("eval")),
        ]);
        assert!(from_wire(&bad_direction).is_err());

        let bad_status = WireValue::dict([
            ("id", WireValue::from("1")),
            ("status", WireValue::from("maybe")),
        ]);
        assert!(from_wire(&bad_status).is_err());

        assert!(from_wire(&WireValue::Int(1)).is_err());
    }
}
