//! Storage quota enforcement over the driver hooks.
//!
//! The before-hook locks the roots a mutation touches, checks the prospective
//! total against the volume's maximum and parks the locks on the event. The
//! after-hook applies the realized delta, releases the locks and schedules a
//! recount of every touched root.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::{directory_size_async, StorageLock, StorageManager};
use crate::driver::hooks::{DriverHooks, MutationEvent, MutationKind, Outcome};
use crate::volume::Volume;
use crate::{ConnectorError, Result};

/// Quota assigned to one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeQuota {
    pub volume_id: String,
    /// Maximum bytes; `None` means unlimited.
    pub maximum: Option<u64>,
}

/// Locks held between the before and after hooks of one mutation.
#[derive(Debug, Default)]
struct QuotaTicket {
    target: Option<(Arc<Volume>, StorageLock)>,
    source: Option<(Arc<Volume>, StorageLock)>,
}

/// Enforces per-volume storage quotas.
#[derive(Debug)]
pub struct QuotaPolicy {
    storage: Arc<StorageManager>,
    overrides: RwLock<HashMap<String, Option<u64>>>,
}

impl QuotaPolicy {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self {
            storage,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Storage manager backing this policy.
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// Override a volume's configured maximum.
    pub fn set_quota(&self, quota: VolumeQuota) {
        self.overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(quota.volume_id, quota.maximum);
    }

    /// Effective quota of a volume.
    pub fn quota(&self, volume: &Volume) -> VolumeQuota {
        let maximum = self
            .overrides
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(volume.id())
            .copied()
            .unwrap_or_else(|| volume.max_storage());
        VolumeQuota {
            volume_id: volume.id().to_string(),
            maximum,
        }
    }

    /// Register the quota hooks into every mutating operation.
    pub fn register(self: &Arc<Self>, hooks: &DriverHooks) {
        const GATED: [MutationKind; 9] = [
            MutationKind::Upload,
            MutationKind::Write,
            MutationKind::Copy,
            MutationKind::Move,
            MutationKind::Remove,
            MutationKind::Resize,
            MutationKind::Archive,
            MutationKind::Extract,
            MutationKind::ChunkMerge,
        ];

        for kind in GATED {
            let operation = hooks.for_kind(kind);
            let policy = Arc::clone(self);
            operation.on_before(move |event| {
                let policy = Arc::clone(&policy);
                async move { policy.reserve(event).await }
            });
            let policy = Arc::clone(self);
            operation.on_after(move |event, outcome| {
                let policy = Arc::clone(&policy);
                async move {
                    policy.settle(event, outcome);
                    Ok(())
                }
            });
        }

        // Chunks land in the temp directory; reject early on the declared
        // total without holding the root across requests.
        let policy = Arc::clone(self);
        hooks.chunk_transfer.on_before(move |event| {
            let policy = Arc::clone(&policy);
            async move { policy.precheck(event).await }
        });
    }

    /// Lock a volume's root, walking it on first use.
    pub async fn lock_volume(&self, volume: &Arc<Volume>) -> Result<StorageLock> {
        let root = volume.root().to_path_buf();
        let thumbnails = volume.thumbnail_dir().to_path_buf();
        let (lock, created) = self
            .storage
            .lock(&volume.storage_key(), || {
                directory_size_async(root.clone(), Some(thumbnails.clone()))
            })
            .await?;
        if created {
            debug!(volume = volume.id(), total = lock.total(), "Storage usage computed");
        }
        Ok(lock)
    }

    /// Current usage of a volume in bytes.
    pub async fn usage(&self, volume: &Arc<Volume>) -> Result<u64> {
        let lock = self.lock_volume(volume).await?;
        Ok(lock.total() as u64)
    }

    fn check(&self, volume: &Volume, lock: &StorageLock, delta: i64) -> Result<()> {
        let Some(maximum) = self.quota(volume).maximum else {
            return Ok(());
        };
        let current = lock.total();
        if delta > 0 && current + delta > maximum as i64 {
            info!(
                volume = volume.id(),
                maximum,
                usage = current,
                delta,
                "Quota exceeded"
            );
            return Err(ConnectorError::Quota {
                maximum,
                usage: current as u64,
            });
        }
        Ok(())
    }

    async fn reserve(&self, event: Arc<MutationEvent>) -> Result<()> {
        let target = Arc::clone(&event.target.volume);
        let source = event
            .source
            .as_ref()
            .filter(|_| !event.same_root())
            .map(|s| Arc::clone(&s.volume))
            .filter(|v| self.quota(v).maximum.is_some());
        let target_tracked = self.quota(&target).maximum.is_some();

        if !target_tracked && source.is_none() {
            return Ok(());
        }

        let mut ticket = QuotaTicket::default();
        // Canonical order so two cross-root moves never wait on each other.
        let mut order: Vec<(bool, Arc<Volume>)> = Vec::with_capacity(2);
        if target_tracked {
            order.push((true, target));
        }
        if let Some(source) = source {
            order.push((false, source));
        }
        order.sort_by_key(|(_, volume)| volume.storage_key());

        for (is_target, volume) in order {
            let lock = self.lock_volume(&volume).await?;
            if is_target {
                ticket.target = Some((volume, lock));
            } else {
                ticket.source = Some((volume, lock));
            }
        }

        if let Some((volume, lock)) = &ticket.target {
            self.check(volume, lock, event.estimated_target_delta())?;
        }

        event.stash(ticket);
        Ok(())
    }

    fn settle(&self, event: Arc<MutationEvent>, outcome: Outcome) {
        let Some(mut ticket) = event.take::<QuotaTicket>() else {
            return;
        };

        if let Outcome::Completed(delta) = &outcome {
            let same_root = event.same_root();
            if let Some((_, lock)) = ticket.target.as_mut() {
                let applied = if same_root {
                    delta.target + delta.source
                } else {
                    delta.target
                };
                lock.apply(applied);
            }
            if let Some((_, lock)) = ticket.source.as_mut() {
                lock.apply(delta.source);
            }
        }

        let touched: Vec<Arc<Volume>> = [ticket.target.take(), ticket.source.take()]
            .into_iter()
            .flatten()
            .map(|(volume, lock)| {
                self.storage.unlock(Some(lock));
                volume
            })
            .collect();

        if outcome == Outcome::Vetoed {
            return;
        }
        for volume in touched {
            self.recount(&volume);
        }
    }

    /// Schedule a background recount of a volume's root.
    pub fn recount(&self, volume: &Volume) {
        let root = volume.root().to_path_buf();
        let thumbnails = volume.thumbnail_dir().to_path_buf();
        self.storage.schedule_recount(volume.storage_key(), move || {
            directory_size_async(root, Some(thumbnails))
        });
    }

    async fn precheck(&self, event: Arc<MutationEvent>) -> Result<()> {
        let volume = Arc::clone(&event.target.volume);
        if self.quota(&volume).maximum.is_none() {
            return Ok(());
        }
        let lock = self.lock_volume(&volume).await?;
        let result = self.check(&volume, &lock, event.estimated_target_delta());
        self.storage.unlock(Some(lock));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::hooks::{Delta, HookTarget};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(maximum: Option<u64>) -> (TempDir, Arc<Volume>, Arc<QuotaPolicy>, DriverHooks) {
        let temp_dir = TempDir::new().unwrap();
        let mut volume = Volume::new("v1_", temp_dir.path()).unwrap();
        if let Some(maximum) = maximum {
            volume = volume.with_max_storage(maximum);
        }
        let storage = Arc::new(StorageManager::with_limits(
            Duration::from_secs(60),
            Duration::from_secs(60),
            16,
        ));
        let policy = Arc::new(QuotaPolicy::new(storage));
        let hooks = DriverHooks::default();
        policy.register(&hooks);
        (temp_dir, Arc::new(volume), policy, hooks)
    }

    fn upload_event(volume: &Arc<Volume>, name: &str, bytes: u64) -> MutationEvent {
        MutationEvent::new(
            MutationKind::Upload,
            HookTarget::new(volume, volume.root().join(name), false),
        )
        .with_incoming(bytes)
    }

    async fn write_file(hooks: &DriverHooks, volume: &Arc<Volume>, name: &str, bytes: u64) -> Result<()> {
        let path = volume.root().join(name);
        hooks
            .upload
            .run(upload_event(volume, name, bytes), |_| async move {
                tokio::fs::write(&path, vec![0u8; bytes as usize]).await?;
                Ok(((), Delta::target(bytes as i64)))
            })
            .await
    }

    async fn settled_usage(policy: &QuotaPolicy, volume: &Arc<Volume>) -> i64 {
        // Let pending recounts finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        policy
            .storage()
            .cached_total(&volume.storage_key())
            .await
            .unwrap_or(-1)
    }

    #[tokio::test]
    async fn test_rejects_over_quota() {
        let (_temp_dir, volume, policy, hooks) = setup(Some(1000));

        write_file(&hooks, &volume, "a.bin", 400).await.unwrap();
        assert_eq!(settled_usage(&policy, &volume).await, 400);

        let result = write_file(&hooks, &volume, "b.bin", 700).await;
        match result {
            Err(ConnectorError::Quota { maximum, usage }) => {
                assert_eq!(maximum, 1000);
                assert_eq!(usage, 400);
            }
            other => panic!("expected quota error, got {other:?}"),
        }
        assert!(!volume.root().join("b.bin").exists());
        assert_eq!(settled_usage(&policy, &volume).await, 400);
    }

    #[tokio::test]
    async fn test_overwrite_counts_net_delta() {
        let (_temp_dir, volume, policy, hooks) = setup(Some(1000));
        write_file(&hooks, &volume, "a.bin", 900).await.unwrap();

        let path = volume.root().join("a.bin");
        let event = upload_event(&volume, "a.bin", 950).with_overwritten(900);
        hooks
            .upload
            .run(event, |_| async move {
                tokio::fs::write(&path, vec![0u8; 950]).await?;
                Ok(((), Delta::target(50)))
            })
            .await
            .unwrap();

        assert_eq!(settled_usage(&policy, &volume).await, 950);
    }

    #[tokio::test]
    async fn test_failed_operation_does_not_count() {
        let (_temp_dir, volume, policy, hooks) = setup(Some(1000));
        let result: Result<()> = hooks
            .upload
            .run(upload_event(&volume, "a.bin", 100), |_| async {
                Err(ConnectorError::PermissionDenied)
            })
            .await;
        assert!(result.is_err());
        assert_eq!(settled_usage(&policy, &volume).await, 0);
    }

    #[tokio::test]
    async fn test_remove_frees_space() {
        let (_temp_dir, volume, policy, hooks) = setup(Some(1000));
        write_file(&hooks, &volume, "a.bin", 400).await.unwrap();

        let path = volume.root().join("a.bin");
        let event = MutationEvent::new(
            MutationKind::Remove,
            HookTarget::new(&volume, path.clone(), false),
        )
        .with_outgoing(400);
        hooks
            .remove
            .run(event, |_| async move {
                tokio::fs::remove_file(&path).await?;
                Ok(((), Delta::target(-400)))
            })
            .await
            .unwrap();

        assert_eq!(settled_usage(&policy, &volume).await, 0);
    }

    #[tokio::test]
    async fn test_unlimited_volume_is_not_tracked() {
        let (_temp_dir, volume, policy, hooks) = setup(None);
        write_file(&hooks, &volume, "a.bin", 400).await.unwrap();
        assert!(!policy.storage().contains(&volume.storage_key()));
    }

    #[tokio::test]
    async fn test_override_quota() {
        let (_temp_dir, volume, policy, hooks) = setup(None);
        policy.set_quota(VolumeQuota {
            volume_id: "v1_".to_string(),
            maximum: Some(10),
        });
        assert_eq!(policy.quota(&volume).maximum, Some(10));
        assert!(matches!(
            write_file(&hooks, &volume, "a.bin", 11).await,
            Err(ConnectorError::Quota { maximum: 10, usage: 0 })
        ));
    }

    #[tokio::test]
    async fn test_chunk_precheck_rejects_declared_total() {
        let (_temp_dir, volume, _policy, hooks) = setup(Some(100));
        let event = MutationEvent::new(
            MutationKind::ChunkTransfer,
            HookTarget::new(&volume, volume.root().join("big.bin"), false),
        )
        .with_incoming(500);
        let result: Result<()> = hooks
            .chunk_transfer
            .run(event, |_| async { Ok(((), Delta::NONE)) })
            .await;
        assert!(matches!(result, Err(ConnectorError::Quota { .. })));
    }

    #[tokio::test]
    async fn test_cross_root_move_adjusts_both() {
        let (_temp_dir, target, policy, hooks) = setup(Some(1000));
        let other_dir = TempDir::new().unwrap();
        let source = Arc::new(
            Volume::new("v2_", other_dir.path())
                .unwrap()
                .with_max_storage(1000),
        );
        std::fs::write(source.root().join("m.bin"), vec![0u8; 300]).unwrap();
        assert_eq!(policy.usage(&source).await.unwrap(), 300);

        let from = source.root().join("m.bin");
        let to = target.root().join("m.bin");
        let event = MutationEvent::new(MutationKind::Move, HookTarget::new(&target, to.clone(), false))
            .with_source(HookTarget::new(&source, from.clone(), false))
            .with_incoming(300)
            .with_outgoing(300);
        hooks
            .move_
            .run(event, |_| async move {
                tokio::fs::copy(&from, &to).await?;
                tokio::fs::remove_file(&from).await?;
                Ok((
                    (),
                    Delta {
                        target: 300,
                        source: -300,
                    },
                ))
            })
            .await
            .unwrap();

        assert_eq!(settled_usage(&policy, &target).await, 300);
        assert_eq!(settled_usage(&policy, &source).await, 0);
    }
}
