//! The object encoder/decoder collaborator.
//!
//! Encoders are selected by the request's `Accept` list, decoders by its
//! `Content-Type`. Objects travel as [`serde_json::Value`] at the trait
//! boundary so implementations stay object-safe; the bundled [`JsonCodec`]
//! covers `application/json`.

use std::sync::Arc;

use http::HeaderMap;
use mime::Mime;
use thiserror::Error;

use crate::headers;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode object")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to decode object")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Serializes objects to bytes under a declared media type.
pub trait ObjectEncoder: Send + Sync {
    fn media_type(&self) -> Mime;
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError>;
}

/// Parses bytes into objects for one or more accepted media types.
pub trait ObjectDecoder: Send + Sync {
    fn media_types(&self) -> Vec<Mime>;
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError>;
}

pub struct JsonCodec;

impl ObjectEncoder for JsonCodec {
    fn media_type(&self) -> Mime {
        mime::APPLICATION_JSON
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|err| CodecError::Encode(err.into()))
    }
}

impl ObjectDecoder for JsonCodec {
    fn media_types(&self) -> Vec<Mime> {
        vec![mime::APPLICATION_JSON]
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.into()))
    }
}

/// Registered codecs plus the Accept/Content-Type selection logic.
pub struct CodecRegistry {
    encoders: Vec<Arc<dyn ObjectEncoder>>,
    decoders: Vec<Arc<dyn ObjectDecoder>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let json = Arc::new(JsonCodec);
        CodecRegistry {
            encoders: vec![json.clone()],
            decoders: vec![json],
        }
    }
}

impl CodecRegistry {
    pub fn new() -> CodecRegistry {
        CodecRegistry {
            encoders: Vec::new(),
            decoders: Vec::new(),
        }
    }

    pub fn register_encoder(&mut self, encoder: impl ObjectEncoder + 'static) {
        self.encoders.push(Arc::new(encoder));
    }

    pub fn register_decoder(&mut self, decoder: impl ObjectDecoder + 'static) {
        self.decoders.push(Arc::new(decoder));
    }

    /// Picks the encoder for the request's `Accept` list, most-preferred
    /// first. Without an `Accept` header the first registered encoder wins.
    pub fn encoder_for(&self, headers: &HeaderMap) -> Option<Arc<dyn ObjectEncoder>> {
        let accepted = headers::accept(headers);
        if accepted.is_empty() {
            return self.encoders.first().cloned();
        }
        for (candidate, _) in accepted {
            let mime: Mime = match candidate.parse() {
                Ok(mime) => mime,
                Err(_) => continue,
            };
            for encoder in &self.encoders {
                if media_type_accepts(&mime, &encoder.media_type()) {
                    return Some(encoder.clone());
                }
            }
        }
        None
    }

    /// Picks the decoder matching the request's `Content-Type`.
    pub fn decoder_for(&self, headers: &HeaderMap) -> Option<Arc<dyn ObjectDecoder>> {
        let content_type = headers::content_type(headers)?;
        self.decoders
            .iter()
            .find(|decoder| {
                decoder
                    .media_types()
                    .iter()
                    .any(|mime| mime.essence_str() == content_type.essence_str())
            })
            .cloned()
    }
}

fn media_type_accepts(accepted: &Mime, offered: &Mime) -> bool {
    let type_ok = accepted.type_() == mime::STAR || accepted.type_() == offered.type_();
    let subtype_ok = accepted.subtype() == mime::STAR || accepted.subtype() == offered.subtype();
    type_ok && subtype_ok
}
