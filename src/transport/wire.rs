use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::bundle::envelope::{
    Bundle, BundleDependency, BundleEntry, BundleSyncMode, BundleType,
};

/// Wire framing selected at startup. Both framings carry the same logical
/// envelope; only the outer record shape differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportFormat {
    /// Native framed records for the streaming broker path.
    Streamed,
    /// CloudEvents binary content mode over a generic broker.
    CloudEvents,
}

impl TransportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportFormat::Streamed => "streamed",
            TransportFormat::CloudEvents => "cloudevents",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "streamed" => Some(TransportFormat::Streamed),
            "cloudevents" => Some(TransportFormat::CloudEvents),
            _ => None,
        }
    }
}

impl fmt::Display for TransportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CloudEvents type attribute prefix for status bundles.
const CLOUDEVENTS_TYPE_PREFIX: &str = "io.stratus.status.";

/// Errors raised while decoding an envelope. Decode failures drop the
/// message; the offset still advances via the committer's minimum scan.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("payload is not valid base64: {0}")]
    PayloadEncoding(#[source] base64::DecodeError),
    #[error("payload digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },
    #[error("malformed payload entries: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("unknown bundle type {0:?}")]
    UnknownBundleType(String),
    #[error("unknown sync mode {0:?}")]
    UnknownSyncMode(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    leaf_hub_name: String,
    bundle_type: String,
    generation: u64,
    sync_mode: String,
    base_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependency_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependency_generation: Option<u64>,
    payload_b64: String,
    payload_sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCloudEvent {
    specversion: String,
    id: String,
    source: String,
    #[serde(rename = "type")]
    event_type: String,
    datacontenttype: String,
    generation: u64,
    syncmode: String,
    basegeneration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependencytype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependencygeneration: Option<u64>,
    data_base64: String,
    datasha256: String,
}

fn digest_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

fn payload_bytes(bundle: &Bundle) -> Vec<u8> {
    serde_json::to_vec(bundle.entries()).expect("entry maps always serialize")
}

fn dependency_fields(bundle: &Bundle) -> (Option<String>, Option<u64>) {
    match bundle.dependency() {
        Some(dependency) => (
            Some(dependency.bundle_type.as_str().to_string()),
            Some(dependency.required_generation),
        ),
        None => (None, None),
    }
}

/// Serializes a bundle in the requested framing.
pub fn encode_bundle(format: TransportFormat, bundle: &Bundle) -> Vec<u8> {
    let payload = payload_bytes(bundle);
    let digest = digest_hex(&payload);
    let encoded = general_purpose::STANDARD.encode(&payload);
    let (dependency_type, dependency_generation) = dependency_fields(bundle);
    match format {
        TransportFormat::Streamed => {
            let envelope = WireEnvelope {
                leaf_hub_name: bundle.leaf_hub().to_string(),
                bundle_type: bundle.bundle_type().as_str().to_string(),
                generation: bundle.generation(),
                sync_mode: bundle.sync_mode().as_str().to_string(),
                base_generation: bundle.base_generation(),
                dependency_type,
                dependency_generation,
                payload_b64: encoded,
                payload_sha256: digest,
            };
            serde_json::to_vec(&envelope).expect("envelopes always serialize")
        }
        TransportFormat::CloudEvents => {
            let event = WireCloudEvent {
                specversion: "1.0".to_string(),
                id: format!(
                    "{}.{}.{}",
                    bundle.leaf_hub(),
                    bundle.bundle_type(),
                    bundle.generation()
                ),
                source: bundle.leaf_hub().to_string(),
                event_type: format!("{CLOUDEVENTS_TYPE_PREFIX}{}", bundle.bundle_type()),
                datacontenttype: "application/json".to_string(),
                generation: bundle.generation(),
                syncmode: bundle.sync_mode().as_str().to_string(),
                basegeneration: bundle.base_generation(),
                dependencytype: dependency_type,
                dependencygeneration: dependency_generation,
                data_base64: encoded,
                datasha256: digest,
            };
            serde_json::to_vec(&event).expect("envelopes always serialize")
        }
    }
}

struct LogicalEnvelope {
    leaf_hub: String,
    bundle_type: String,
    generation: u64,
    sync_mode: String,
    base_generation: u64,
    dependency_type: Option<String>,
    dependency_generation: Option<u64>,
    payload_b64: String,
    payload_sha256: String,
}

/// Decodes a record in the requested framing back into a bundle, verifying
/// the payload digest along the way.
pub fn decode_bundle(format: TransportFormat, raw: &[u8]) -> Result<Bundle, DecodeError> {
    let logical = match format {
        TransportFormat::Streamed => {
            let envelope: WireEnvelope =
                serde_json::from_slice(raw).map_err(DecodeError::Envelope)?;
            LogicalEnvelope {
                leaf_hub: envelope.leaf_hub_name,
                bundle_type: envelope.bundle_type,
                generation: envelope.generation,
                sync_mode: envelope.sync_mode,
                base_generation: envelope.base_generation,
                dependency_type: envelope.dependency_type,
                dependency_generation: envelope.dependency_generation,
                payload_b64: envelope.payload_b64,
                payload_sha256: envelope.payload_sha256,
            }
        }
        TransportFormat::CloudEvents => {
            let event: WireCloudEvent =
                serde_json::from_slice(raw).map_err(DecodeError::Envelope)?;
            let bundle_type = event
                .event_type
                .strip_prefix(CLOUDEVENTS_TYPE_PREFIX)
                .unwrap_or(&event.event_type)
                .to_string();
            LogicalEnvelope {
                leaf_hub: event.source,
                bundle_type,
                generation: event.generation,
                sync_mode: event.syncmode,
                base_generation: event.basegeneration,
                dependency_type: event.dependencytype,
                dependency_generation: event.dependencygeneration,
                payload_b64: event.data_base64,
                payload_sha256: event.datasha256,
            }
        }
    };

    let bundle_type = BundleType::parse(&logical.bundle_type)
        .ok_or_else(|| DecodeError::UnknownBundleType(logical.bundle_type.clone()))?;
    let sync_mode = BundleSyncMode::parse(&logical.sync_mode)
        .ok_or_else(|| DecodeError::UnknownSyncMode(logical.sync_mode.clone()))?;

    let payload = general_purpose::STANDARD
        .decode(&logical.payload_b64)
        .map_err(DecodeError::PayloadEncoding)?;
    let computed = digest_hex(&payload);
    if computed != logical.payload_sha256 {
        return Err(DecodeError::DigestMismatch {
            expected: logical.payload_sha256,
            computed,
        });
    }
    let entries: BTreeMap<String, BundleEntry> =
        serde_json::from_slice(&payload).map_err(DecodeError::Payload)?;

    let mut bundle = match sync_mode {
        BundleSyncMode::Complete => {
            Bundle::complete(logical.leaf_hub, bundle_type, logical.generation)
        }
        BundleSyncMode::Delta => Bundle::delta(
            logical.leaf_hub,
            bundle_type,
            logical.generation,
            logical.base_generation,
        ),
    }
    .with_entries(entries);

    if let (Some(dep_type), Some(dep_generation)) =
        (logical.dependency_type, logical.dependency_generation)
    {
        let dep_type = BundleType::parse(&dep_type)
            .ok_or(DecodeError::UnknownBundleType(dep_type))?;
        bundle = bundle.with_dependency(BundleDependency::new(dep_type, dep_generation));
    }

    Ok(bundle)
}
