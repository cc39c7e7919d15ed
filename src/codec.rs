// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON payload encoding used at the publish and consume boundaries.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

pub fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(msg).map_err(|err| {
        error!(error = err.to_string(), "failure to encode payload");
        AmqpError::from(err)
    })
}

pub fn decode<M: DeserializeOwned>(data: &[u8]) -> Result<M, AmqpError> {
    serde_json::from_slice(data).map_err(|err| {
        error!(error = err.to_string(), "failure to decode payload");
        AmqpError::from(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn message_survives_encoding() {
        let msg = Message::new("greeting", "olá, mundo \"quoted\"");
        let decoded: Message = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn edge_case_strings_survive_encoding() {
        let cases = [
            Message::new("", ""),
            Message::new("emoji 🐇📨", "𝄞 outside the basic plane"),
            Message::new("tab\tnew\nline", "nul \u{0} bell \u{7} del \u{7f}"),
            Message::new("\\ backslash /", "\u{2028}\u{2029}"),
        ];

        for msg in cases {
            let decoded: Message = decode(&encode(&msg).unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn malformed_payload_is_a_serialization_error() {
        let err = decode::<Message>(b"{\"title\":").unwrap_err();
        assert!(matches!(err, AmqpError::SerializationError(_)));

        let err = decode::<Message>(b"{\"title\":\"only\"}").unwrap_err();
        assert!(matches!(err, AmqpError::SerializationError(_)));
    }
}
