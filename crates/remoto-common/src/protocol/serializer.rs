//! Serializer boundary
//!
//! The RPC engine never looks inside payloads. It only knows a serializer by its
//! numeric id, which travels in every message header, and by the five
//! operations of the [`Serializer`] trait.

use serde_json::{Map, Value};

use crate::protocol::error::{RemotoError, Result};

/// Serializer id of [`JsonSerializer`].
pub const JSON_SERIALIZER_ID: u16 = 2;

/// Serializer id of [`MsgpackSerializer`].
pub const MSGPACK_SERIALIZER_ID: u16 = 6;

/// A decoded method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub object_id: String,
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// Codec for call payloads and result values.
///
/// Calls are encoded as the four-element sequence
/// `[object_id, method, args, kwargs]`; implementors only need to provide
/// `dumps`/`loads`, the call helpers are derived from them.
pub trait Serializer: Send + Sync {
    /// Numeric id negotiated over the wire.
    fn id(&self) -> u16;

    /// Human readable name, used in logs and configuration.
    fn name(&self) -> &'static str;

    fn dumps(&self, value: &Value) -> Result<Vec<u8>>;

    fn loads(&self, data: &[u8]) -> Result<Value>;

    fn dumps_call(
        &self,
        object_id: &str,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Vec<u8>> {
        let call = Value::Array(vec![
            Value::String(object_id.to_string()),
            Value::String(method.to_string()),
            Value::Array(args.to_vec()),
            Value::Object(kwargs.clone()),
        ]);
        self.dumps(&call)
    }

    fn loads_call(&self, data: &[u8]) -> Result<CallRequest> {
        let value = self.loads(data)?;
        let mut parts = match value {
            Value::Array(parts) if parts.len() == 4 => parts.into_iter(),
            _ => return Err(RemotoError::Serialize("invalid call payload".to_string())),
        };

        let mut next = || parts.next().unwrap_or(Value::Null);
        let object_id = match next() {
            Value::String(s) => s,
            _ => return Err(RemotoError::Serialize("call object id must be a string".to_string())),
        };
        let method = match next() {
            Value::String(s) => s,
            _ => return Err(RemotoError::Serialize("call method must be a string".to_string())),
        };
        let args = match next() {
            Value::Array(a) => a,
            Value::Null => Vec::new(),
            _ => return Err(RemotoError::Serialize("call args must be a list".to_string())),
        };
        let kwargs = match next() {
            Value::Object(m) => m,
            Value::Null => Map::new(),
            _ => return Err(RemotoError::Serialize("call kwargs must be a mapping".to_string())),
        };

        Ok(CallRequest {
            object_id,
            method,
            args,
            kwargs,
        })
    }
}

/// JSON serializer, the default.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn id(&self) -> u16 {
        JSON_SERIALIZER_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// MessagePack serializer.
pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn id(&self) -> u16 {
        MSGPACK_SERIALIZER_ID
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

static JSON: JsonSerializer = JsonSerializer;
static MSGPACK: MsgpackSerializer = MsgpackSerializer;

/// Looks up a serializer by the id found in a message header.
pub fn serializer_for_id(id: u16) -> Result<&'static dyn Serializer> {
    match id {
        JSON_SERIALIZER_ID => Ok(&JSON),
        MSGPACK_SERIALIZER_ID => Ok(&MSGPACK),
        other => Err(RemotoError::Serialize(format!("invalid serializer id: {}", other))),
    }
}

/// Looks up a serializer by its configured name.
pub fn serializer_for_name(name: &str) -> Result<&'static dyn Serializer> {
    match name {
        "json" => Ok(&JSON),
        "msgpack" => Ok(&MSGPACK),
        other => Err(RemotoError::Serialize(format!("unknown serializer: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_call_round_trip() {
        let ser = serializer_for_id(JSON_SERIALIZER_ID).unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("scale".to_string(), json!(2));
        let data = ser
            .dumps_call("obj_1", "multiply", &[json!(6), json!(7)], &kwargs)
            .unwrap();
        let call = ser.loads_call(&data).unwrap();
        assert_eq!(call.object_id, "obj_1");
        assert_eq!(call.method, "multiply");
        assert_eq!(call.args, vec![json!(6), json!(7)]);
        assert_eq!(call.kwargs["scale"], json!(2));
    }

    #[test]
    fn test_msgpack_value_round_trip() {
        let ser = serializer_for_name("msgpack").unwrap();
        assert_eq!(ser.id(), MSGPACK_SERIALIZER_ID);
        let value = json!({"name": "remoto", "items": [1, 2, 3], "ok": true});
        let data = ser.dumps(&value).unwrap();
        assert_eq!(ser.loads(&data).unwrap(), value);
    }

    #[test]
    fn test_unknown_serializer_id() {
        let err = serializer_for_id(99).err().unwrap();
        assert!(matches!(err, RemotoError::Serialize(_)));
    }

    #[test]
    fn test_malformed_call_payload() {
        let ser = serializer_for_name("json").unwrap();
        let data = ser.dumps(&json!(["obj", "method"])).unwrap();
        assert!(ser.loads_call(&data).is_err());
    }
}
