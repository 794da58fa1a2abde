//! Outbound compensation calls to connected omegas.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{GlobalTxId, LocalTxId};
use dashmap::DashMap;
use domain::Branch;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::CallbackError;

/// Instruction sent to an omega to undo one committed branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationCommand {
    pub global_tx_id: GlobalTxId,
    pub local_tx_id: LocalTxId,
    pub parent_tx_id: Option<LocalTxId>,
    pub service_name: String,
    /// Instance that reported the branch start, preferred for the call.
    pub instance_id: Option<String>,
    pub compensation_method: Option<String>,
    pub payload: Option<serde_json::Value>,
    /// 1-based attempt number of this call.
    pub attempt: u32,
}

impl CompensationCommand {
    pub fn for_branch(global_tx_id: &GlobalTxId, branch: &Branch) -> Self {
        Self {
            global_tx_id: global_tx_id.clone(),
            local_tx_id: branch.local_tx_id.clone(),
            parent_tx_id: branch.parent_tx_id.clone(),
            service_name: branch.service_name.clone().unwrap_or_default(),
            instance_id: branch.instance_id.clone(),
            compensation_method: branch.compensation_method.clone(),
            payload: branch.payload.clone(),
            attempt: branch.retries + 1,
        }
    }
}

/// A connected omega able to run compensation methods.
#[async_trait]
pub trait OmegaCallback: Send + Sync {
    /// Runs the compensation and resolves once the omega has answered.
    async fn compensate(&self, command: &CompensationCommand) -> Result<(), CallbackError>;
}

/// Result of looking up a callback for a service.
#[derive(Clone)]
pub enum Lookup {
    Connected(Arc<dyn OmegaCallback>),
    NotConnected,
}

impl std::fmt::Debug for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lookup::Connected(_) => f.write_str("Connected"),
            Lookup::NotConnected => f.write_str("NotConnected"),
        }
    }
}

/// Connected omegas, keyed by service name then instance id.
pub struct CallbackRegistry {
    services: DashMap<String, IndexMap<String, Arc<dyn OmegaCallback>>>,
    /// Bumped on every connect.
    connects: watch::Sender<u64>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self {
            services: DashMap::new(),
            connects: watch::channel(0).0,
        }
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance, replacing any previous handle for it.
    pub fn connect(
        &self,
        service: impl Into<String>,
        instance: impl Into<String>,
        callback: Arc<dyn OmegaCallback>,
    ) {
        let service = service.into();
        let instance = instance.into();
        tracing::info!(%service, %instance, "omega connected");
        self.services
            .entry(service)
            .or_default()
            .insert(instance, callback);
        self.connects.send_modify(|count| *count += 1);
    }

    /// Returns false if the instance was not connected.
    pub fn disconnect(&self, service: &str, instance: &str) -> bool {
        let removed = self
            .services
            .get_mut(service)
            .is_some_and(|mut instances| instances.shift_remove(instance).is_some());
        self.services.remove_if(service, |_, instances| instances.is_empty());
        if removed {
            tracing::info!(%service, %instance, "omega disconnected");
        }
        removed
    }

    /// Finds a callback for `service`, preferring `instance` when connected.
    pub fn lookup(&self, service: &str, instance: Option<&str>) -> Lookup {
        let Some(instances) = self.services.get(service) else {
            return Lookup::NotConnected;
        };
        let preferred = instance.and_then(|id| instances.get(id));
        match preferred.or_else(|| instances.values().next()) {
            Some(callback) => Lookup::Connected(Arc::clone(callback)),
            None => Lookup::NotConnected,
        }
    }

    pub fn is_connected(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Resolves once at least one instance of `service` is connected.
    pub async fn wait_for(&self, service: &str) {
        let mut connects = self.connects.subscribe();
        while !self.is_connected(service) {
            if connects.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn instances(&self, service: &str) -> Vec<String> {
        self.services
            .get(service)
            .map(|instances| instances.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Looks up the owning service and runs the compensation.
    pub async fn compensate(&self, command: &CompensationCommand) -> Result<(), CallbackError> {
        match self.lookup(&command.service_name, command.instance_id.as_deref()) {
            Lookup::Connected(callback) => callback.compensate(command).await,
            Lookup::NotConnected => Err(CallbackError::NotConnected {
                service: command.service_name.clone(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryCallbackState {
    calls: Vec<CompensationCommand>,
    compensated: Vec<LocalTxId>,
    fail_always: bool,
    fail_next: u32,
    delay: Option<Duration>,
}

/// In-memory omega for testing.
///
/// Records every call in order and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOmegaCallback {
    state: Arc<Mutex<InMemoryCallbackState>>,
}

impl InMemoryOmegaCallback {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryCallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every call fail until switched off.
    pub fn set_fail_always(&self, fail: bool) {
        self.state().fail_always = fail;
    }

    /// Makes the next `count` calls fail.
    pub fn fail_next(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Delays every call, simulating a slow participant.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<CompensationCommand> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Branches compensated successfully, in order.
    pub fn compensated(&self) -> Vec<LocalTxId> {
        self.state().compensated.clone()
    }
}

#[async_trait]
impl OmegaCallback for InMemoryOmegaCallback {
    async fn compensate(&self, command: &CompensationCommand) -> Result<(), CallbackError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(command.clone());
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_always {
            return Err(CallbackError::Failed("participant refused".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(CallbackError::Failed("participant unavailable".to_string()));
        }
        state.compensated.push(command.local_tx_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(service: &str, instance: Option<&str>) -> CompensationCommand {
        CompensationCommand {
            global_tx_id: GlobalTxId::parse("g-1").unwrap(),
            local_tx_id: LocalTxId::parse("l-1").unwrap(),
            parent_tx_id: None,
            service_name: service.to_string(),
            instance_id: instance.map(str::to_string),
            compensation_method: Some("undo".to_string()),
            payload: None,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn unknown_service_is_not_connected() {
        let registry = CallbackRegistry::new();
        assert!(matches!(registry.lookup("billing", None), Lookup::NotConnected));
        assert_eq!(
            registry.compensate(&command("billing", None)).await,
            Err(CallbackError::NotConnected {
                service: "billing".to_string()
            })
        );
    }

    #[tokio::test]
    async fn prefers_the_reporting_instance() {
        let registry = CallbackRegistry::new();
        let first = InMemoryOmegaCallback::new();
        let second = InMemoryOmegaCallback::new();
        registry.connect("billing", "b-0", Arc::new(first.clone()));
        registry.connect("billing", "b-1", Arc::new(second.clone()));

        registry
            .compensate(&command("billing", Some("b-1")))
            .await
            .unwrap();
        assert_eq!(first.call_count(), 0);
        assert_eq!(second.call_count(), 1);

        // Falls back to any instance when the preferred one is gone.
        registry
            .compensate(&command("billing", Some("b-9")))
            .await
            .unwrap();
        assert_eq!(first.call_count(), 1);
    }

    #[tokio::test]
    async fn wait_for_resolves_once_the_service_connects() {
        let registry = Arc::new(CallbackRegistry::new());
        let waiter = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.wait_for("billing").await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        registry.connect("shipping", "s-0", Arc::new(InMemoryOmegaCallback::new()));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        registry.connect("billing", "b-0", Arc::new(InMemoryOmegaCallback::new()));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_connected("billing"));
    }

    #[tokio::test]
    async fn disconnect_removes_instance_and_empty_service() {
        let registry = CallbackRegistry::new();
        registry.connect("billing", "b-0", Arc::new(InMemoryOmegaCallback::new()));

        assert!(registry.disconnect("billing", "b-0"));
        assert!(!registry.disconnect("billing", "b-0"));
        assert!(registry.instances("billing").is_empty());
        assert!(matches!(registry.lookup("billing", None), Lookup::NotConnected));
    }

    #[tokio::test]
    async fn in_memory_callback_fails_on_request() {
        let omega = InMemoryOmegaCallback::new();
        omega.fail_next(1);

        assert!(omega.compensate(&command("billing", None)).await.is_err());
        assert!(omega.compensate(&command("billing", None)).await.is_ok());
        assert_eq!(omega.call_count(), 2);
        assert_eq!(omega.compensated().len(), 1);
    }
}
