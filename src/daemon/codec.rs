//! Argument codecs for request payloads.
//!
//! The envelope codec gets a request's argument across the wire as raw JSON;
//! the session then runs it through this registry to produce the value handed
//! to the work implementation. Work implementations may register a codec for
//! their own kind to reshape the input before execution. When the session
//! failed to initialize it switches to [`CodecMode::Discard`], under which
//! incoming payload bytes are consumed and dropped without ever being
//! decoded.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::value::RawValue;

use crate::error::WorkError;
use crate::work::WorkSpec;

/// Reshapes a work kind's input before it reaches the handler.
pub trait ArgumentCodec: Send + Sync {
    fn decode_input(&self, input: serde_json::Value) -> Result<serde_json::Value, WorkError>;
}

/// Extensible registry of per-kind argument codecs. Registered in the
/// session's service scope so work implementations can add their own.
#[derive(Default)]
pub struct ArgumentCodecs {
    by_kind: RwLock<HashMap<String, Arc<dyn ArgumentCodec>>>,
}

impl ArgumentCodecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, codec: Arc<dyn ArgumentCodec>) {
        if let Ok(mut by_kind) = self.by_kind.write() {
            by_kind.insert(kind.into(), codec);
        }
    }

    /// Decode a raw request payload. The payload must be a [`WorkSpec`]; if a
    /// codec is registered for its kind, the spec's input is run through it.
    pub fn decode(&self, raw: &RawValue) -> Result<serde_json::Value, WorkError> {
        let mut spec: WorkSpec = serde_json::from_str(raw.get())
            .map_err(|e| WorkError::InvalidArgument(e.to_string()))?;
        let codec = self
            .by_kind
            .read()
            .ok()
            .and_then(|by_kind| by_kind.get(&spec.kind).cloned());
        if let Some(codec) = codec {
            spec.input = codec.decode_input(spec.input)?;
        }
        serde_json::to_value(spec).map_err(|e| WorkError::InvalidArgument(e.to_string()))
    }
}

/// How the session treats incoming payloads.
pub enum CodecMode {
    /// Normal operation: decode through the registry.
    Registered(Arc<ArgumentCodecs>),
    /// Initialization failed; payloads are dropped undecoded since no codec
    /// for them was ever registered.
    Discard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkSpec;
    use serde_json::json;

    fn raw_spec(spec: &WorkSpec) -> Box<RawValue> {
        RawValue::from_string(serde_json::to_string(spec).unwrap()).unwrap()
    }

    #[test]
    fn test_decode_plain_spec() {
        let codecs = ArgumentCodecs::new();
        let raw = raw_spec(&WorkSpec::new("arith.double", json!(5)));
        let decoded = codecs.decode(&raw).unwrap();
        assert_eq!(decoded["kind"], "arith.double");
        assert_eq!(decoded["input"], json!(5));
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let codecs = ArgumentCodecs::new();
        let raw = RawValue::from_string("[1,2,3]".to_string()).unwrap();
        let err = codecs.decode(&raw).unwrap_err();
        assert!(matches!(err, WorkError::InvalidArgument(_)));
    }

    #[test]
    fn test_registered_codec_reshapes_input() {
        struct Stringify;
        impl ArgumentCodec for Stringify {
            fn decode_input(
                &self,
                input: serde_json::Value,
            ) -> Result<serde_json::Value, WorkError> {
                Ok(json!(input.to_string()))
            }
        }

        let codecs = ArgumentCodecs::new();
        codecs.register("custom.kind", Arc::new(Stringify));

        let raw = raw_spec(&WorkSpec::new("custom.kind", json!({"a": 1})));
        let decoded = codecs.decode(&raw).unwrap();
        assert_eq!(decoded["input"], json!(r#"{"a":1}"#));

        // Other kinds pass through untouched
        let raw = raw_spec(&WorkSpec::new("arith.double", json!(5)));
        let decoded = codecs.decode(&raw).unwrap();
        assert_eq!(decoded["input"], json!(5));
    }

    #[test]
    fn test_codec_error_propagates() {
        struct Reject;
        impl ArgumentCodec for Reject {
            fn decode_input(
                &self,
                _input: serde_json::Value,
            ) -> Result<serde_json::Value, WorkError> {
                Err(WorkError::InvalidArgument("nope".to_string()))
            }
        }

        let codecs = ArgumentCodecs::new();
        codecs.register("custom.kind", Arc::new(Reject));
        let raw = raw_spec(&WorkSpec::new("custom.kind", json!(1)));
        assert!(codecs.decode(&raw).is_err());
    }
}
