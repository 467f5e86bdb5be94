//! Cluster-scoped advisory lock serializing transitions.
//!
//! The lock is a named record in the system namespace. Creating it is the
//! acquisition; the API server's create-if-absent semantics decide races
//! between concurrent callers. An orphaned record must be removed by an
//! operator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cluster::{ControlPlane, LockRecord};
use crate::error::EdgeError;

/// Proof of ownership returned by [`LockManager::acquire`].
///
/// Consumed by [`LockManager::release`].
#[derive(Debug)]
#[must_use = "the lock stays held until released"]
pub struct LockGuard {
    holder: String,
    acquired_at: DateTime<Utc>,
}

impl LockGuard {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

pub struct LockManager {
    client: Arc<dyn ControlPlane>,
    namespace: String,
    name: String,
    holder: String,
}

impl LockManager {
    pub fn new(client: Arc<dyn ControlPlane>, namespace: &str, name: &str, holder: String) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            holder,
        }
    }

    /// Identity for this process: host name plus a random suffix.
    pub fn holder_identity() -> String {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "edgectl".to_string());
        format!("{host}/{}", Uuid::new_v4())
    }

    pub async fn current(&self) -> Result<Option<LockRecord>, EdgeError> {
        Ok(self.client.get_lock(&self.namespace, &self.name).await?)
    }

    pub async fn acquire(&self) -> Result<LockGuard, EdgeError> {
        if let Some(existing) = self.current().await? {
            if existing.holder == self.holder {
                debug!(lock = %self.name, "lock already held by this process");
                return Ok(LockGuard {
                    holder: existing.holder,
                    acquired_at: existing.acquired_at,
                });
            }
            return Err(EdgeError::LockHeld {
                holder: existing.holder,
            });
        }

        let record = LockRecord {
            name: self.name.clone(),
            holder: self.holder.clone(),
            acquired_at: Utc::now(),
        };
        match self.client.create_lock(&self.namespace, &record).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                // Lost the race between our read and create.
                let holder = self
                    .current()
                    .await?
                    .map(|r| r.holder)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(EdgeError::LockHeld { holder });
            }
            Err(e) => return Err(e.into()),
        }
        info!(lock = %self.name, holder = %self.holder, "transition lock acquired");
        Ok(LockGuard {
            holder: record.holder,
            acquired_at: record.acquired_at,
        })
    }

    /// Delete the record if this process owns it. Releasing an absent lock succeeds.
    pub async fn release(&self, guard: LockGuard) -> Result<(), EdgeError> {
        match self.current().await? {
            None => {
                debug!(lock = %self.name, "lock already absent");
                return Ok(());
            }
            Some(record) if record.holder != guard.holder => {
                return Err(EdgeError::NotOwner {
                    holder: record.holder,
                });
            }
            Some(_) => {}
        }
        match self.client.delete_lock(&self.namespace, &self.name).await {
            Ok(()) => {
                info!(lock = %self.name, "transition lock released");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(EdgeError::LockReleaseFailed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{MemoryCluster, Op};

    const NS: &str = "kube-system";
    const NAME: &str = "edgectl-lock";

    fn manager(cluster: &Arc<MemoryCluster>, holder: &str) -> LockManager {
        LockManager::new(cluster.clone(), NS, NAME, holder.to_string())
    }

    #[tokio::test]
    async fn acquire_then_release_clears_record() {
        let cluster = Arc::new(MemoryCluster::new());
        let lock = manager(&cluster, "me");

        let guard = lock.acquire().await.unwrap();
        assert_eq!(guard.holder(), "me");
        assert_eq!(cluster.lock_record(NS, NAME).unwrap().holder, "me");

        lock.release(guard).await.unwrap();
        assert!(cluster.lock_record(NS, NAME).is_none());
    }

    #[tokio::test]
    async fn second_holder_gets_lock_held() {
        let cluster = Arc::new(MemoryCluster::new());
        let first = manager(&cluster, "first");
        let second = manager(&cluster, "second");

        let _guard = first.acquire().await.unwrap();
        match second.acquire().await {
            Err(EdgeError::LockHeld { holder }) => assert_eq!(holder, "first"),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reacquire_by_owner_succeeds() {
        let cluster = Arc::new(MemoryCluster::new());
        let lock = manager(&cluster, "me");
        let _first = lock.acquire().await.unwrap();
        let again = lock.acquire().await.unwrap();
        assert_eq!(again.holder(), "me");
    }

    #[tokio::test]
    async fn release_of_absent_lock_is_noop() {
        let cluster = Arc::new(MemoryCluster::new());
        let lock = manager(&cluster, "me");
        let guard = lock.acquire().await.unwrap();
        let stale = LockGuard {
            holder: "me".into(),
            acquired_at: guard.acquired_at(),
        };
        lock.release(guard).await.unwrap();
        lock.release(stale).await.unwrap();
    }

    #[tokio::test]
    async fn release_by_non_owner_fails() {
        let cluster = Arc::new(MemoryCluster::new());
        let owner = manager(&cluster, "owner");
        let _owned = owner.acquire().await.unwrap();

        let impostor = manager(&cluster, "impostor");
        let fake = LockGuard {
            holder: "impostor".into(),
            acquired_at: Utc::now(),
        };
        match impostor.release(fake).await {
            Err(EdgeError::NotOwner { holder }) => assert_eq!(holder, "owner"),
            other => panic!("expected NotOwner, got {other:?}"),
        }
        assert!(cluster.lock_record(NS, NAME).is_some());
    }

    #[tokio::test]
    async fn release_failure_is_reported() {
        let cluster = Arc::new(MemoryCluster::new());
        let lock = manager(&cluster, "me");
        let guard = lock.acquire().await.unwrap();
        cluster.fail_on(Op::DeleteLock, NAME);
        assert!(matches!(
            lock.release(guard).await,
            Err(EdgeError::LockReleaseFailed(_))
        ));
    }

    #[test]
    fn holder_identity_is_unique() {
        assert_ne!(LockManager::holder_identity(), LockManager::holder_identity());
    }
}
