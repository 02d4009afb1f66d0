//! Request/response envelope carried in the body of a data frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Structured payload of a data frame.
///
/// The same type is used for requests and responses: requests fill
/// `object_name`, `method`, `metadata` and `body`; responses echo
/// `request_id` and fill `body`, `code` and `desc`.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Correlation key, unique among in-flight calls of one client.
    #[prost(uint32, tag = "1")]
    #[serde(rename = "requestId", skip_serializing_if = "is_zero_u32")]
    pub request_id: u32,

    /// Name of the service object the request addresses.
    #[prost(string, tag = "2")]
    #[serde(rename = "obj", skip_serializing_if = "String::is_empty")]
    pub object_name: String,

    /// Method name within the service object.
    #[prost(string, tag = "3")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// String key/value metadata (content type, trace token, peer address).
    #[prost(map = "string, string", tag = "4")]
    #[serde(rename = "meta", skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    /// Opaque request or response payload.
    #[prost(bytes = "vec", tag = "5")]
    #[serde(with = "base64_body", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,

    /// Result code, zero on success.
    #[prost(int32, tag = "6")]
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub code: i32,

    /// Result description accompanying a non-zero code.
    #[prost(string, tag = "7")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub desc: String,
}

impl Envelope {
    /// Clears every field while keeping allocated capacity.
    pub fn reset(&mut self) {
        self.request_id = 0;
        self.object_name.clear();
        self.method.clear();
        self.metadata.clear();
        self.body.clear();
        self.code = 0;
        self.desc.clear();
    }

    /// Takes the contents of `other`, copying into this envelope's existing
    /// allocations.
    pub(crate) fn absorb(&mut self, other: Self) {
        self.reset();
        self.request_id = other.request_id;
        self.object_name.push_str(&other.object_name);
        self.method.push_str(&other.method);
        self.metadata.extend(other.metadata);
        self.body.extend_from_slice(&other.body);
        self.code = other.code;
        self.desc.push_str(&other.desc);
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero_i32(value: &i32) -> bool {
    *value == 0
}

/// Bytes as a base64 string in JSON, matching other JSON encoders of `[]byte`.
mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Option::<String>::deserialize(deserializer)?.map_or_else(
            || Ok(Vec::new()),
            |encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn sample() -> Envelope {
        Envelope {
            request_id: 7,
            object_name: "greeter".to_string(),
            method: "SayHello".to_string(),
            metadata: HashMap::from([("content-type".to_string(), "json".to_string())]),
            body: b"{\"name\":\"ann\"}".to_vec(),
            code: 0,
            desc: String::new(),
        }
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(sample()).unwrap();

        assert_eq!(json["requestId"], 7);
        assert_eq!(json["obj"], "greeter");
        assert_eq!(json["method"], "SayHello");
        assert_eq!(json["meta"]["content-type"], "json");
        assert_eq!(json["body"], "eyJuYW1lIjoiYW5uIn0=");
        assert!(json.get("code").is_none());
        assert!(json.get("desc").is_none());
    }

    #[test]
    fn test_json_missing_and_null_fields_default() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"requestId":3,"body":null,"code":5}"#).unwrap();

        assert_eq!(envelope.request_id, 3);
        assert!(envelope.body.is_empty());
        assert_eq!(envelope.code, 5);
        assert!(envelope.method.is_empty());
    }

    #[test]
    fn test_proto_roundtrip() {
        let envelope = sample();
        let bytes = envelope.encode_to_vec();

        assert_eq!(Envelope::decode(bytes.as_slice()).unwrap(), envelope);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut envelope = sample();
        let capacity = envelope.body.capacity();

        envelope.reset();

        assert_eq!(envelope, Envelope::default());
        assert_eq!(envelope.body.capacity(), capacity);
    }
}
