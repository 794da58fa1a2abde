//! Omega connections over HTTP.
//!
//! An omega registers an instance, reads compensation commands from a
//! server-sent event stream and answers each one on the ack endpoint. The
//! coordinator sees every connected instance as an [`OmegaCallback`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use coordinator::{CallbackError, CallbackRegistry, CompensationCommand, OmegaCallback};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Commands buffered per instance while its stream is not being read.
const COMMAND_BUFFER: usize = 64;

/// A compensation command as sent to an omega.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCommand {
    /// Echoed back in the [`CommandAck`].
    pub command_id: Uuid,
    #[serde(flatten)]
    pub command: CompensationCommand,
}

/// An omega's answer to one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandStreamError {
    #[error("omega {service}/{instance} is not connected")]
    NotConnected { service: String, instance: String },

    #[error("omega {service}/{instance} already has an open command stream")]
    AlreadyStreaming { service: String, instance: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    service: String,
    instance: String,
}

impl InstanceKey {
    fn new(service: &str, instance: &str) -> Self {
        Self {
            service: service.to_string(),
            instance: instance.to_string(),
        }
    }
}

struct Session {
    commands: Mutex<Option<mpsc::Receiver<OutboundCommand>>>,
}

struct PendingAck {
    key: InstanceKey,
    reply: oneshot::Sender<Result<(), CallbackError>>,
}

type PendingAcks = DashMap<Uuid, PendingAck>;

/// Tracks HTTP omega sessions and the commands waiting for their acks.
pub struct OmegaHub {
    callbacks: Arc<CallbackRegistry>,
    sessions: DashMap<InstanceKey, Session>,
    pending: Arc<PendingAcks>,
    ack_timeout: Duration,
    closing: watch::Sender<bool>,
}

impl OmegaHub {
    pub fn new(callbacks: Arc<CallbackRegistry>, ack_timeout: Duration) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            callbacks,
            sessions: DashMap::new(),
            pending: Arc::new(DashMap::new()),
            ack_timeout,
            closing,
        }
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// Registers an instance, replacing any earlier session it had.
    ///
    /// Commands still waiting on the replaced session fail as disconnected
    /// and are retried by the coordinator.
    pub fn connect(&self, service: &str, instance: &str) {
        let key = InstanceKey::new(service, instance);
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        self.drop_pending(&key);
        self.sessions.insert(
            key.clone(),
            Session {
                commands: Mutex::new(Some(receiver)),
            },
        );

        let callback = HttpOmegaCallback {
            key,
            commands: sender,
            pending: Arc::clone(&self.pending),
            timeout: self.ack_timeout,
        };
        self.callbacks.connect(service, instance, Arc::new(callback));
        metrics::gauge!("omega_sessions").set(self.sessions.len() as f64);
    }

    /// Returns false if the instance was not connected.
    pub fn disconnect(&self, service: &str, instance: &str) -> bool {
        let key = InstanceKey::new(service, instance);
        let existed = self.sessions.remove(&key).is_some();
        self.callbacks.disconnect(service, instance);
        self.drop_pending(&key);
        metrics::gauge!("omega_sessions").set(self.sessions.len() as f64);
        existed
    }

    /// Hands out the command stream of a connected instance. Only one reader
    /// per session; reconnect to get a fresh stream.
    pub fn take_commands(
        &self,
        service: &str,
        instance: &str,
    ) -> Result<mpsc::Receiver<OutboundCommand>, CommandStreamError> {
        let key = InstanceKey::new(service, instance);
        let session = self
            .sessions
            .get(&key)
            .ok_or_else(|| CommandStreamError::NotConnected {
                service: service.to_string(),
                instance: instance.to_string(),
            })?;
        let mut commands = session
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        commands
            .take()
            .ok_or_else(|| CommandStreamError::AlreadyStreaming {
                service: service.to_string(),
                instance: instance.to_string(),
            })
    }

    /// Resolves a pending command. Returns false for unknown or foreign ids.
    pub fn acknowledge(&self, service: &str, instance: &str, ack: CommandAck) -> bool {
        let key = InstanceKey::new(service, instance);
        let Some((_, pending)) = self
            .pending
            .remove_if(&ack.command_id, |_, pending| pending.key == key)
        else {
            return false;
        };

        let result = if ack.success {
            Ok(())
        } else {
            Err(CallbackError::Failed(
                ack.error
                    .unwrap_or_else(|| "compensation failed".to_string()),
            ))
        };
        let _ = pending.reply.send(result);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Signalled once the server starts shutting down.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Ends every open command stream.
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    fn drop_pending(&self, key: &InstanceKey) {
        self.pending.retain(|_, pending| &pending.key != key);
    }
}

/// Resolves when `closing` turns true or its sender goes away.
pub async fn wait_closed(mut closing: watch::Receiver<bool>) {
    while !*closing.borrow_and_update() {
        if closing.changed().await.is_err() {
            return;
        }
    }
}

/// The coordinator's handle on one HTTP omega instance.
struct HttpOmegaCallback {
    key: InstanceKey,
    commands: mpsc::Sender<OutboundCommand>,
    pending: Arc<PendingAcks>,
    timeout: Duration,
}

/// Forgets a pending command when the waiting call goes away.
struct PendingGuard<'a> {
    pending: &'a PendingAcks,
    command_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.command_id);
    }
}

#[async_trait]
impl OmegaCallback for HttpOmegaCallback {
    async fn compensate(&self, command: &CompensationCommand) -> Result<(), CallbackError> {
        let command_id = Uuid::new_v4();
        let (reply, response) = oneshot::channel();
        self.pending.insert(
            command_id,
            PendingAck {
                key: self.key.clone(),
                reply,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            command_id,
        };

        let outbound = OutboundCommand {
            command_id,
            command: command.clone(),
        };
        let exchange = async {
            self.commands
                .send(outbound)
                .await
                .map_err(|_| CallbackError::Disconnected)?;
            response.await.map_err(|_| CallbackError::Disconnected)?
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    service = %self.key.service,
                    instance = %self.key.instance,
                    %command_id,
                    "omega did not acknowledge in time"
                );
                Err(CallbackError::Timeout)
            }
        }
    }
}
