// ABOUTME: Per-host executor pool with lazy construction and reuse.
// ABOUTME: Executors live for one controller run and are closed at teardown.

use super::{ConnectError, ExecutorFactory, HostExecutor};
use crate::config::HostTarget;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lazily constructs and caches one executor per host alias.
///
/// Construction failures are not cached; a later `get` for the same host
/// retries. A cached executor whose transport has died is discarded and
/// rebuilt.
pub struct ExecutorPool {
    factory: Arc<dyn ExecutorFactory>,
    // Async mutex: held across factory.build, so concurrent first-use
    // constructions for different hosts serialize. Steps fan out against
    // already-pooled executors, so this only affects first contact.
    executors: Mutex<HashMap<String, Arc<dyn HostExecutor>>>,
}

impl ExecutorPool {
    pub fn new(factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            factory,
            executors: Mutex::new(HashMap::new()),
        }
    }

    /// Get the pooled executor for a host, constructing it on first use.
    pub async fn get(&self, target: &HostTarget) -> Result<Arc<dyn HostExecutor>, ConnectError> {
        let mut executors = self.executors.lock().await;

        if let Some(existing) = executors.get(&target.alias) {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
            tracing::warn!(host = %target.hostname, "pooled executor is dead, reconnecting");
            let dead = executors.remove(&target.alias);
            if let Some(dead) = dead {
                dead.close().await;
            }
        }

        let executor = self.factory.build(target).await?;
        executors.insert(target.alias.clone(), Arc::clone(&executor));
        Ok(executor)
    }

    /// Close every pooled executor. Errors are logged by the executors
    /// themselves; teardown never fails.
    pub async fn close_all(&self) {
        let mut executors = self.executors.lock().await;
        for (alias, executor) in executors.drain() {
            tracing::debug!(host = %alias, "closing executor");
            executor.close().await;
        }
    }
}
