//! Cached lifecycle state of the backend container
//!
//! The cache is refreshed on demand (every incoming connection triggers a
//! refresh) rather than streamed from runtime events. The container runtime
//! stays the source of truth; a stale cache corrects itself on the next
//! refresh.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Container state, using the runtime's vocabulary plus two local values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Nothing has been looked up yet, or the runtime reported something unexpected
    Unknown,
    /// No container with the configured name exists
    NotCreated,
    Created,
    Running,
    Paused,
    Exited,
    Restarting,
    Removing,
    Dead,
}

impl ContainerState {
    /// Parse the `State` field of a container listing
    pub fn from_runtime(state: &str) -> Self {
        match state {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "exited" => ContainerState::Exited,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Unknown => "unknown",
            ContainerState::NotCreated => "not_created",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a container listing
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as the runtime reports them, with a leading `/`
    pub names: Vec<String>,
    pub state: ContainerState,
}

/// The two runtime operations the gateway needs
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers, including stopped ones, matching `name` as a filter.
    /// The filter may match by substring; callers match exactly.
    async fn list_by_name(&self, name: &str) -> anyhow::Result<Vec<ContainerSummary>>;

    /// Start a container by id
    async fn start_container(&self, id: &str) -> anyhow::Result<()>;
}

struct CachedContainer {
    id: Option<String>,
    state: ContainerState,
}

/// Owns the cached state of the named backend container.
///
/// Concurrent `refresh` and `start` calls from different connections may
/// interleave; the last write wins.
pub struct ContainerController {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    cache: RwLock<CachedContainer>,
}

impl ContainerController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, name: impl Into<String>) -> Self {
        Self {
            runtime,
            name: name.into(),
            cache: RwLock::new(CachedContainer {
                id: None,
                state: ContainerState::Unknown,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached state; no I/O, not guaranteed fresh
    pub fn state(&self) -> ContainerState {
        self.cache.read().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContainerState::Running
    }

    /// Cached container id, if the container has been found
    pub fn container_id(&self) -> Option<String> {
        self.cache.read().id.clone()
    }

    /// Look the container up by exact name. Returns whether it exists.
    ///
    /// On error the cache is left untouched.
    pub async fn refresh(&self) -> anyhow::Result<bool> {
        let containers = self
            .runtime
            .list_by_name(&self.name)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list containers: {}", e))?;

        let wanted = format!("/{}", self.name);
        let found = containers
            .into_iter()
            .find(|c| c.names.iter().any(|n| *n == wanted));

        let mut cache = self.cache.write();
        match found {
            Some(container) => {
                debug!(
                    container = %self.name,
                    id = %container.id,
                    state = %container.state,
                    "Refreshed container state"
                );
                cache.id = Some(container.id);
                cache.state = container.state;
                Ok(true)
            }
            None => {
                cache.id = None;
                cache.state = ContainerState::NotCreated;
                Ok(false)
            }
        }
    }

    /// Start the container unless the cache already says it is running.
    ///
    /// On success the cache is set to `Running` without asking the runtime
    /// again.
    pub async fn start(&self) -> anyhow::Result<()> {
        let id = {
            let cache = self.cache.read();
            if cache.state == ContainerState::Running {
                return Ok(());
            }
            cache.id.clone()
        };

        let id = id.ok_or_else(|| {
            anyhow::anyhow!("Container '{}' does not exist", self.name)
        })?;

        self.runtime.start_container(&id).await.map_err(|e| {
            anyhow::anyhow!("Failed to start container {}: {}", self.name, e)
        })?;

        info!(container = %self.name, id = %id, "Container started");
        self.cache.write().state = ContainerState::Running;
        Ok(())
    }
}
