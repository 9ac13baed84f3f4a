//! Before/after hook lists around driver mutations.
//!
//! Every mutating driver operation runs through an [`OperationHooks`] pair:
//! before-hooks run in registration order and may veto by returning an
//! error; after-hooks always all run, receive the [`Outcome`], and the first
//! error among them is reported once every hook has run.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use uuid::Uuid;

use crate::volume::Volume;
use crate::Result;

/// Which mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Upload,
    Write,
    Copy,
    Move,
    Remove,
    Resize,
    Archive,
    Extract,
    ChunkTransfer,
    ChunkMerge,
    ChunkRollback,
}

impl MutationKind {
    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Upload => "upload",
            MutationKind::Write => "write",
            MutationKind::Copy => "copy",
            MutationKind::Move => "move",
            MutationKind::Remove => "remove",
            MutationKind::Resize => "resize",
            MutationKind::Archive => "archive",
            MutationKind::Extract => "extract",
            MutationKind::ChunkTransfer => "chunk_transfer",
            MutationKind::ChunkMerge => "chunk_merge",
            MutationKind::ChunkRollback => "chunk_rollback",
        }
    }
}

/// A file-system entry touched by a mutation.
#[derive(Debug, Clone)]
pub struct HookTarget {
    pub volume: Arc<Volume>,
    pub path: PathBuf,
    pub is_dir: bool,
}

impl HookTarget {
    pub fn new(volume: &Arc<Volume>, path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            volume: Arc::clone(volume),
            path: path.into(),
            is_dir,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Realized byte change of a completed mutation.
///
/// `target` applies to the target's root, `source` to the source's root
/// (or to the target's root when there is no source).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delta {
    pub target: i64,
    pub source: i64,
}

impl Delta {
    /// No byte change.
    pub const NONE: Delta = Delta {
        target: 0,
        source: 0,
    };

    /// Change on the target's root only.
    pub fn target(bytes: i64) -> Self {
        Self {
            target: bytes,
            source: 0,
        }
    }
}

/// What happened between the before and after hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The mutation ran to completion.
    Completed(Delta),
    /// The mutation was attempted and failed.
    Failed(String),
    /// A before-hook vetoed the mutation; nothing was attempted.
    Vetoed,
}

/// Context handed to every hook of one mutation.
pub struct MutationEvent {
    pub id: Uuid,
    pub kind: MutationKind,
    /// Entry being created, replaced or removed.
    pub target: HookTarget,
    /// Origin of a move or copy.
    pub source: Option<HookTarget>,
    /// Bytes the mutation adds under the target's root.
    pub incoming: u64,
    /// Bytes the mutation takes away from the source's root.
    pub outgoing: u64,
    /// Bytes already at the target that the mutation replaces.
    pub overwritten: u64,
    /// Whether an existing entry is being replaced.
    pub overwrite: bool,
    stash: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
}

impl std::fmt::Debug for MutationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationEvent")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &self.target.path)
            .field("source", &self.source.as_ref().map(|s| &s.path))
            .field("incoming", &self.incoming)
            .field("outgoing", &self.outgoing)
            .field("overwritten", &self.overwritten)
            .finish()
    }
}

impl MutationEvent {
    /// Create an event for `kind` on `target`.
    pub fn new(kind: MutationKind, target: HookTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target,
            source: None,
            incoming: 0,
            outgoing: 0,
            overwritten: 0,
            overwrite: false,
            stash: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, source: HookTarget) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_incoming(mut self, bytes: u64) -> Self {
        self.incoming = bytes;
        self
    }

    pub fn with_outgoing(mut self, bytes: u64) -> Self {
        self.outgoing = bytes;
        self
    }

    /// Mark the target as replaced; `bytes` is its current size.
    pub fn with_overwritten(mut self, bytes: u64) -> Self {
        self.overwrite = true;
        self.overwritten = bytes;
        self
    }

    /// Whether source and target live under the same root.
    pub fn same_root(&self) -> bool {
        match &self.source {
            Some(source) => source.volume.storage_key() == self.target.volume.storage_key(),
            None => true,
        }
    }

    /// Prospective byte change on the target's root.
    pub fn estimated_target_delta(&self) -> i64 {
        let mut delta = self.incoming as i64 - self.overwritten as i64;
        if self.same_root() {
            delta -= self.outgoing as i64;
        }
        delta
    }

    /// Park per-event state for a later hook of the same policy.
    ///
    /// Stashed values are dropped with the event, so guards stored here are
    /// released even if the after-hooks never run.
    pub fn stash<T: Any + Send>(&self, value: T) {
        self.stash
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Take back a value parked with [`MutationEvent::stash`].
    pub fn take<T: Any + Send>(&self) -> Option<T> {
        self.stash
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }
}

type BeforeHook = Arc<dyn Fn(Arc<MutationEvent>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type AfterHook =
    Arc<dyn Fn(Arc<MutationEvent>, Outcome) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Ordered before/after hook lists for one kind of mutation.
#[derive(Default)]
pub struct OperationHooks {
    before: RwLock<Vec<BeforeHook>>,
    after: RwLock<Vec<AfterHook>>,
}

impl std::fmt::Debug for OperationHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHooks")
            .field("before", &self.before_count())
            .field("after", &self.after_count())
            .finish()
    }
}

impl OperationHooks {
    /// Append a before-hook. Returning an error vetoes the mutation.
    pub fn on_before<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<MutationEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: BeforeHook = Arc::new(move |event| hook(event).boxed());
        self.before
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Append an after-hook.
    pub fn on_after<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<MutationEvent>, Outcome) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: AfterHook = Arc::new(move |event, outcome| hook(event, outcome).boxed());
        self.after
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn before_count(&self) -> usize {
        self.before.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn after_count(&self) -> usize {
        self.after.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run before-hooks, the mutation, then after-hooks.
    ///
    /// The mutation's own error takes precedence over after-hook errors.
    pub async fn run<T, F, Fut>(&self, event: MutationEvent, op: F) -> Result<T>
    where
        F: FnOnce(Arc<MutationEvent>) -> Fut,
        Fut: Future<Output = Result<(T, Delta)>>,
    {
        let event = Arc::new(event);
        let before: Vec<BeforeHook> = self
            .before
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for hook in &before {
            if let Err(e) = hook(Arc::clone(&event)).await {
                // Hooks that already acquired resources release them here.
                self.run_after(&event, Outcome::Vetoed).await.ok();
                return Err(e);
            }
        }

        match op(Arc::clone(&event)).await {
            Ok((value, delta)) => {
                self.run_after(&event, Outcome::Completed(delta)).await?;
                Ok(value)
            }
            Err(e) => {
                self.run_after(&event, Outcome::Failed(e.to_string()))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn run_after(&self, event: &Arc<MutationEvent>, outcome: Outcome) -> Result<()> {
        let after: Vec<AfterHook> = self
            .after
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut first_error = None;
        for hook in &after {
            if let Err(e) = hook(Arc::clone(event), outcome.clone()).await {
                tracing::warn!(
                    kind = event.kind.as_str(),
                    path = %event.target.path.display(),
                    error = %e,
                    "after-hook failed"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Hook lists for every mutating driver operation.
///
/// Rename goes through `move_`.
#[derive(Debug, Default)]
pub struct DriverHooks {
    pub upload: OperationHooks,
    pub write: OperationHooks,
    pub copy: OperationHooks,
    pub move_: OperationHooks,
    pub remove: OperationHooks,
    pub resize: OperationHooks,
    pub archive: OperationHooks,
    pub extract: OperationHooks,
    pub chunk_transfer: OperationHooks,
    pub chunk_merge: OperationHooks,
    pub chunk_rollback: OperationHooks,
}

impl DriverHooks {
    /// Hook lists for a kind of mutation.
    pub fn for_kind(&self, kind: MutationKind) -> &OperationHooks {
        match kind {
            MutationKind::Upload => &self.upload,
            MutationKind::Write => &self.write,
            MutationKind::Copy => &self.copy,
            MutationKind::Move => &self.move_,
            MutationKind::Remove => &self.remove,
            MutationKind::Resize => &self.resize,
            MutationKind::Archive => &self.archive,
            MutationKind::Extract => &self.extract,
            MutationKind::ChunkTransfer => &self.chunk_transfer,
            MutationKind::ChunkMerge => &self.chunk_merge,
            MutationKind::ChunkRollback => &self.chunk_rollback,
        }
    }

    /// Every kind that has hook lists.
    pub const KINDS: [MutationKind; 11] = [
        MutationKind::Upload,
        MutationKind::Write,
        MutationKind::Copy,
        MutationKind::Move,
        MutationKind::Remove,
        MutationKind::Resize,
        MutationKind::Archive,
        MutationKind::Extract,
        MutationKind::ChunkTransfer,
        MutationKind::ChunkMerge,
        MutationKind::ChunkRollback,
    ];
}
