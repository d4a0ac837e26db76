use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::bundle::envelope::Bundle;
use crate::transport::consumer::InMemoryBroker;
use crate::transport::wire::{encode_bundle, TransportFormat};

/// Delivery lifecycle events surfaced to producer subscribers. `Attempt`
/// fires before the send; exactly one of `Success` or `Failure` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    Attempt,
    Success,
    Failure,
}

/// Callback registered per transport key.
pub type DeliveryCallback = Arc<dyn Fn(DeliveryEvent) + Send + Sync>;

/// Publish-side transport error.
#[derive(Debug, Clone)]
pub struct PublishError {
    message: String,
}

impl PublishError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PublishError {}

/// Agent-side publisher. Implementations fire delivery events for every
/// publish so the hybrid sync manager can steer its mode.
pub trait Producer: Send {
    /// Whether the transport can carry delta bundles at all. When false,
    /// hybrid mode stays disabled and agents ship complete snapshots only.
    fn supports_delta(&self) -> bool;

    fn subscribe(&mut self, transport_key: &str, callback: DeliveryCallback);

    fn publish(&mut self, transport_key: &str, bundle: &Bundle) -> Result<(), PublishError>;
}

#[derive(Default)]
struct SubscriptionTable {
    callbacks: BTreeMap<String, Vec<DeliveryCallback>>,
}

impl SubscriptionTable {
    fn subscribe(&mut self, transport_key: &str, callback: DeliveryCallback) {
        self.callbacks
            .entry(transport_key.to_string())
            .or_default()
            .push(callback);
    }

    fn fire(&self, transport_key: &str, event: DeliveryEvent) {
        if let Some(callbacks) = self.callbacks.get(transport_key) {
            for callback in callbacks {
                callback(event);
            }
        }
    }
}

/// Producer feeding the in-process broker; used by tests and
/// single-process deployments.
pub struct ChannelProducer {
    broker: InMemoryBroker,
    format: TransportFormat,
    delta_capable: bool,
    subscriptions: SubscriptionTable,
}

impl ChannelProducer {
    pub fn new(broker: InMemoryBroker, format: TransportFormat) -> Self {
        Self {
            broker,
            format,
            delta_capable: true,
            subscriptions: SubscriptionTable::default(),
        }
    }

    pub fn without_delta_support(mut self) -> Self {
        self.delta_capable = false;
        self
    }
}

impl Producer for ChannelProducer {
    fn supports_delta(&self) -> bool {
        self.delta_capable
    }

    fn subscribe(&mut self, transport_key: &str, callback: DeliveryCallback) {
        self.subscriptions.subscribe(transport_key, callback);
    }

    fn publish(&mut self, transport_key: &str, bundle: &Bundle) -> Result<(), PublishError> {
        self.subscriptions.fire(transport_key, DeliveryEvent::Attempt);
        let payload = encode_bundle(self.format, bundle);
        match self.broker.publish(transport_key, payload) {
            Ok(_) => {
                self.subscriptions.fire(transport_key, DeliveryEvent::Success);
                Ok(())
            }
            Err(error) => {
                self.subscriptions.fire(transport_key, DeliveryEvent::Failure);
                Err(PublishError::new(format!("broker publish failed: {error}")))
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct WirePublishRequest<'a> {
    transport_key: &'a str,
    format: &'a str,
    envelope_b64: String,
}

/// Blocking HTTP producer that posts envelopes to the ingest gateway.
pub struct HttpGatewayProducer {
    client: reqwest::blocking::Client,
    endpoint: String,
    format: TransportFormat,
    delta_capable: bool,
    subscriptions: SubscriptionTable,
}

impl HttpGatewayProducer {
    /// Creates a producer targeting the provided gateway base endpoint
    /// (e.g. `https://hub.example.com:9443`). Whether the gateway accepts
    /// delta bundles is part of its advertised contract and is supplied by
    /// configuration.
    pub fn new(
        endpoint: impl Into<String>,
        format: TransportFormat,
        delta_capable: bool,
    ) -> Result<Self, PublishError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(PublishError::new("gateway endpoint must not be empty"));
        }
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|err| PublishError::new(format!("http client build failed: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            format,
            delta_capable,
            subscriptions: SubscriptionTable::default(),
        })
    }

    fn publish_url(&self) -> String {
        format!("{}/v1/publish", self.endpoint.trim_end_matches('/'))
    }

    fn send(&self, transport_key: &str, bundle: &Bundle) -> Result<(), PublishError> {
        let payload = encode_bundle(self.format, bundle);
        let request = WirePublishRequest {
            transport_key,
            format: self.format.as_str(),
            envelope_b64: general_purpose::STANDARD.encode(payload),
        };
        let response = self
            .client
            .post(self.publish_url())
            .json(&request)
            .send()
            .map_err(|err| PublishError::new(format!("publish rpc failed: {err}")))?;
        if !response.status().is_success() {
            return Err(PublishError::new(format!(
                "publish rpc returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl Producer for HttpGatewayProducer {
    fn supports_delta(&self) -> bool {
        self.delta_capable
    }

    fn subscribe(&mut self, transport_key: &str, callback: DeliveryCallback) {
        self.subscriptions.subscribe(transport_key, callback);
    }

    fn publish(&mut self, transport_key: &str, bundle: &Bundle) -> Result<(), PublishError> {
        self.subscriptions.fire(transport_key, DeliveryEvent::Attempt);
        match self.send(transport_key, bundle) {
            Ok(()) => {
                self.subscriptions.fire(transport_key, DeliveryEvent::Success);
                Ok(())
            }
            Err(error) => {
                self.subscriptions.fire(transport_key, DeliveryEvent::Failure);
                Err(error)
            }
        }
    }
}
