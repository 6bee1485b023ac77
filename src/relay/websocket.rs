/**
 * relay/websocket.rs
 *
 * TLS WebSocket relay client (self-signed certs allowed when configured)
 */

use super::{Relay, SubscriberTable, SubscriptionCallback, SubscriptionId};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, info, trace, warn};

/// Relay wire messages. Payloads are hex so they stay opaque to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: String,
    },
    Message {
        topic: String,
        payload: String,
    },
    Keepalive,
    Error {
        message: String,
    },
}

/// Relay client speaking JSON over a (TLS) WebSocket
pub struct WebSocketRelay {
    outbound: mpsc::UnboundedSender<RelayMessage>,
    table: Arc<Mutex<SubscriberTable>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketRelay {
    /// Connect to a `ws://` or `wss://` relay
    pub async fn connect(url: &str, accept_invalid_certs: bool) -> Result<Self> {
        let request = url.into_client_request().context("Invalid relay URL")?;

        let connector = if request.uri().scheme_str() == Some("wss") {
            let mut tls_builder = TlsConnector::builder();
            tls_builder.danger_accept_invalid_certs(accept_invalid_certs);
            let tls = tls_builder.build().context("Failed to build TLS connector")?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws_stream, _resp) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .context("Relay WebSocket handshake failed")?;
        info!(url, "connected to relay");

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RelayMessage>();
        let table = Arc::new(Mutex::new(SubscriberTable::default()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "relay message serialization failed");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    warn!(error = %e, "relay send failed, stopping writer");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_table = Arc::clone(&table);
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => handle_incoming(&reader_table, &text),
                    Ok(Message::Close(_)) => {
                        info!("relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "relay receive failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound,
            table,
            tasks: vec![writer, reader],
        })
    }

    fn send(&self, msg: RelayMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| anyhow!("Relay connection closed"))
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn handle_incoming(table: &Mutex<SubscriberTable>, text: &str) {
    let parsed: RelayMessage = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "undecodable relay message");
            return;
        }
    };

    match parsed {
        RelayMessage::Message { topic, payload } => {
            let payload = match hex::decode(&payload) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(topic = %topic, error = %e, "relay payload is not hex");
                    return;
                }
            };
            let callbacks = table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .callbacks(&topic);
            trace!(topic = %topic, subscribers = callbacks.len(), "relay message");
            for callback in callbacks {
                callback(payload.clone());
            }
        }
        RelayMessage::Error { message } => warn!(message = %message, "relay reported an error"),
        _ => {}
    }
}

#[async_trait]
impl Relay for WebSocketRelay {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.send(RelayMessage::Publish {
            topic: topic.to_string(),
            payload: hex::encode(payload),
        })
    }

    async fn subscribe(&self, topic: &str, callback: SubscriptionCallback) -> Result<SubscriptionId> {
        let (id, first) = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(topic, callback);
        if first {
            self.send(RelayMessage::Subscribe {
                topic: topic.to_string(),
            })?;
        }
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<()> {
        let last = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic, id);
        if last {
            self.send(RelayMessage::Unsubscribe {
                topic: topic.to_string(),
            })?;
        }
        Ok(())
    }
}
