//! Producer side: inject one event into a running server.

use crate::config::PublisherConfig;
use crate::subscription::protocol::{self, ControlMessage, ProtocolError, CONTROL_SUBPROTOCOL};
use futures::SinkExt;
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid endpoint '{url}': {source}")]
    InvalidEndpoint {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("timed out connecting to {url} after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error(transparent)]
    Encode(#[from] ProtocolError),
    #[error("failed to send event: {0}")]
    Send(#[source] tungstenite::Error),
}

/// Opens a short-lived control connection per event.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    url: String,
    timeout: Duration,
}

impl BroadcastPublisher {
    pub fn new(config: &PublisherConfig) -> Self {
        Self {
            url: config.url(),
            timeout: config.connect_timeout(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fire-and-forget. Delivery failures are logged and swallowed.
    pub async fn publish(&self, subscription: &str, payload: Value) {
        if let Err(e) = self.try_publish(subscription, payload).await {
            warn!(subscription = %subscription, error = %e, "Event not delivered");
        }
    }

    /// Like [`publish`](Self::publish) but reports whether the event was
    /// handed to the server.
    pub async fn try_publish(&self, subscription: &str, payload: Value) -> Result<(), PublishError> {
        let text = protocol::encode_control(&ControlMessage::Publish {
            subscription: subscription.to_string(),
            payload,
        })?;

        let mut request =
            self.url
                .as_str()
                .into_client_request()
                .map_err(|source| PublishError::InvalidEndpoint {
                    url: self.url.clone(),
                    source,
                })?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(CONTROL_SUBPROTOCOL),
        );

        let (mut ws, _) = tokio::time::timeout(self.timeout, connect_async(request))
            .await
            .map_err(|_| PublishError::Timeout {
                url: self.url.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| PublishError::Connect {
                url: self.url.clone(),
                source,
            })?;

        ws.send(Message::Text(text)).await.map_err(PublishError::Send)?;
        // Close errors after a successful send don't lose the event
        if let Err(e) = ws.close(None).await {
            debug!(error = %e, "Control connection close failed");
        }

        debug!(subscription = %subscription, "Event published");
        Ok(())
    }
}
