//! In-memory service registry with discovery, health checks, and watchers.
//!
//! Mutations and reads go through one exclusive lock. Watcher callbacks are
//! invoked in the order mutations commit; a failing callback never prevents
//! the others from running.

use crate::error::FabricError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Service status in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Inactive,
    Starting,
    Stopping,
    Error,
    Unknown,
}

/// Lifecycle event delivered to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered,
    Updated,
    Unregistered,
}

/// Information about a registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
}

/// Parameters for registering a service.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub endpoint: Option<String>,
    pub metadata: Map<String, Value>,
    pub tags: BTreeSet<String>,
    pub health_check_url: Option<String>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }
}

/// Async watcher callback: `(service, event)`.
pub type WatchCallback =
    Arc<dyn Fn(ServiceInfo, RegistryEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct Watcher {
    id: String,
    /// `None` watches every service type.
    service_type: Option<String>,
    callback: WatchCallback,
}

#[derive(Default)]
struct RegistryState {
    services: HashMap<String, ServiceInfo>,
    watchers: Vec<Watcher>,
}

/// Serialised registry snapshot for bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryExport {
    pub services: Vec<ServiceInfo>,
}

/// In-memory service registry.
#[derive(Default)]
pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under a unique name.
    pub async fn register(
        &self,
        name: impl Into<String>,
        service_type: impl Into<String>,
        registration: Registration,
    ) -> Result<ServiceInfo, FabricError> {
        let name = name.into();
        let service_type = service_type.into();

        let (service, watchers) = {
            let mut state = self.state.lock().await;
            if state.services.contains_key(&name) {
                return Err(FabricError::AlreadyExists(name));
            }

            let now = Utc::now();
            let service = ServiceInfo {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                service_type: service_type.clone(),
                status: ServiceStatus::Active,
                endpoint: registration.endpoint,
                metadata: registration.metadata,
                tags: registration.tags,
                registered_at: now,
                updated_at: now,
                health_check_url: registration.health_check_url,
            };
            state.services.insert(name.clone(), service.clone());
            info!(%name, r#type = %service_type, "registered service");
            (service.clone(), collect_watchers(&state, &service))
        };

        notify(watchers, service.clone(), RegistryEvent::Registered).await;
        Ok(service)
    }

    /// Remove a service. Returns `false` when the name is unknown.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            match state.services.remove(name) {
                Some(service) => {
                    info!(%name, "unregistered service");
                    Some((service.clone(), collect_watchers(&state, &service)))
                }
                None => None,
            }
        };

        match removed {
            Some((service, watchers)) => {
                notify(watchers, service, RegistryEvent::Unregistered).await;
                true
            }
            None => false,
        }
    }

    /// Discover services by type, tag subset, and status.
    pub async fn discover(
        &self,
        service_type: Option<&str>,
        tags: Option<&BTreeSet<String>>,
        status: Option<ServiceStatus>,
    ) -> Vec<ServiceInfo> {
        let state = self.state.lock().await;
        state
            .services
            .values()
            .filter(|s| service_type.map_or(true, |t| s.service_type == t))
            .filter(|s| tags.map_or(true, |wanted| wanted.is_subset(&s.tags)))
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .cloned()
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<ServiceInfo> {
        self.state.lock().await.services.get(name).cloned()
    }

    /// Update a service's status. Watchers fire only on actual transitions.
    pub async fn update_status(&self, name: &str, status: ServiceStatus) -> bool {
        let updated = {
            let mut state = self.state.lock().await;
            match state.services.get_mut(name) {
                Some(service) => {
                    let old = service.status;
                    service.status = status;
                    service.updated_at = Utc::now();
                    if old != status {
                        info!(%name, from = ?old, to = ?status, "service status changed");
                        let service = service.clone();
                        Some((service.clone(), collect_watchers(&state, &service)))
                    } else {
                        None
                    }
                }
                None => return false,
            }
        };

        if let Some((service, watchers)) = updated {
            notify(watchers, service, RegistryEvent::Updated).await;
        }
        true
    }

    /// Patch a service's metadata, merging or replacing.
    pub async fn update_metadata(
        &self,
        name: &str,
        metadata: Map<String, Value>,
        merge: bool,
    ) -> bool {
        let updated = {
            let mut state = self.state.lock().await;
            match state.services.get_mut(name) {
                Some(service) => {
                    if merge {
                        service.metadata.extend(metadata);
                    } else {
                        service.metadata = metadata;
                    }
                    service.updated_at = Utc::now();
                    let service = service.clone();
                    (service.clone(), collect_watchers(&state, &service))
                }
                None => return false,
            }
        };

        notify(updated.1, updated.0, RegistryEvent::Updated).await;
        true
    }

    /// Probe a service's health URL. Without a URL the current status
    /// decides. A non-200 reply transitions the service to ERROR.
    pub async fn health_check(&self, name: &str) -> Result<bool, FabricError> {
        let service =
            self.get(name).await.ok_or_else(|| FabricError::NotFound(name.to_string()))?;

        let url = match &service.health_check_url {
            Some(url) => url.clone(),
            None => return Ok(service.status == ServiceStatus::Active),
        };

        let client = reqwest::Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
            .map_err(|e| FabricError::Connection(format!("failed to build client: {e}")))?;

        let healthy = match client.get(&url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                warn!(%name, error = %e, "health check failed");
                false
            }
        };

        let status = if healthy { ServiceStatus::Active } else { ServiceStatus::Error };
        self.update_status(name, status).await;
        Ok(healthy)
    }

    /// Probe every registered service.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let names: Vec<String> =
            self.state.lock().await.services.keys().cloned().collect();
        let mut results = HashMap::new();
        for name in names {
            let healthy = self.health_check(&name).await.unwrap_or(false);
            results.insert(name, healthy);
        }
        results
    }

    /// Watch for service transitions, optionally filtered by type. Returns a
    /// watcher id usable with [`unwatch`](Self::unwatch).
    pub async fn watch(&self, service_type: Option<&str>, callback: WatchCallback) -> String {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state.watchers.push(Watcher {
            id: id.clone(),
            service_type: service_type.map(str::to_string),
            callback,
        });
        id
    }

    pub async fn unwatch(&self, watcher_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.watchers.len();
        state.watchers.retain(|w| w.id != watcher_id);
        state.watchers.len() != before
    }

    pub async fn list_types(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut types: Vec<String> =
            state.services.values().map(|s| s.service_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    pub async fn list_tags(&self) -> BTreeSet<String> {
        let state = self.state.lock().await;
        state.services.values().flat_map(|s| s.tags.iter().cloned()).collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every service, notifying watchers per removal.
    pub async fn clear(&self) {
        let removed = {
            let mut state = self.state.lock().await;
            let services: Vec<ServiceInfo> = state.services.values().cloned().collect();
            state.services.clear();
            services
                .into_iter()
                .map(|s| {
                    let watchers = collect_watchers(&state, &s);
                    (s, watchers)
                })
                .collect::<Vec<_>>()
        };

        for (service, watchers) in removed {
            notify(watchers, service, RegistryEvent::Unregistered).await;
        }
        info!("cleared registry");
    }

    /// Export the registry for bootstrap.
    pub async fn export(&self) -> RegistryExport {
        let state = self.state.lock().await;
        RegistryExport { services: state.services.values().cloned().collect() }
    }

    /// Replace registry contents from an export, notifying watchers.
    pub async fn import(&self, data: RegistryExport) {
        let imported = {
            let mut state = self.state.lock().await;
            state.services.clear();
            let mut imported = Vec::new();
            for service in data.services {
                state.services.insert(service.name.clone(), service.clone());
                imported.push((service.clone(), collect_watchers(&state, &service)));
            }
            imported
        };

        for (service, watchers) in imported {
            notify(watchers, service, RegistryEvent::Registered).await;
        }
    }
}

fn collect_watchers(state: &RegistryState, service: &ServiceInfo) -> Vec<WatchCallback> {
    state
        .watchers
        .iter()
        .filter(|w| {
            w.service_type.as_deref().map_or(true, |t| t == service.service_type)
        })
        .map(|w| w.callback.clone())
        .collect()
}

// Lock released before callbacks run; one callback cannot block the registry
// or suppress its siblings.
async fn notify(watchers: Vec<WatchCallback>, service: ServiceInfo, event: RegistryEvent) {
    for callback in watchers {
        debug!(name = %service.name, ?event, "notifying watcher");
        callback(service.clone(), event).await;
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").finish()
    }
}
