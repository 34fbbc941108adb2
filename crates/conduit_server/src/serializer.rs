//! Wire serializer contract.
//!
//! The serializer only turns one message's bytes into an envelope and back;
//! framing belongs to the transport.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes outgoing values and decodes incoming envelopes.
pub trait WireSerializer<In, Out>: Send + Sync + 'static {
    /// Encodes `value` into `buffer`, replacing its previous contents.
    fn encode(&self, value: &Out, buffer: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Decodes one complete message.
    fn decode(&self, bytes: &[u8]) -> Result<In, CodecError>;
}

/// JSON wire format backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<In, Out> WireSerializer<In, Out> for JsonSerializer
where
    In: DeserializeOwned,
    Out: Serialize,
{
    fn encode(&self, value: &Out, buffer: &mut Vec<u8>) -> Result<(), CodecError> {
        buffer.clear();
        serde_json::to_writer(&mut *buffer, value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<In, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Envelope {
        route: u32,
        body: String,
    }

    #[test]
    fn test_encode_reuses_buffer() {
        let serializer = JsonSerializer;
        let mut buffer = b"stale bytes from a previous message".to_vec();

        WireSerializer::<Envelope, Envelope>::encode(
            &serializer,
            &Envelope { route: 1, body: "hi".into() },
            &mut buffer,
        )
        .unwrap();

        assert_eq!(buffer, br#"{"route":1,"body":"hi"}"#.to_vec());
    }

    #[test]
    fn test_decode_failure_is_codec_error() {
        let serializer = JsonSerializer;
        let result: Result<Envelope, _> =
            WireSerializer::<Envelope, Envelope>::decode(&serializer, b"not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
