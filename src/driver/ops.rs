//! Mutating operations of [`FileSystemDriver`].
//!
//! Each mutation measures what it will add and remove, wraps the file-system
//! change in the matching hook list and reports the realized [`Delta`].
//! Hooked operations never nest: a paste that replaces an entry removes it
//! inside the paste's own operation.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::hooks::{Delta, HookTarget, MutationEvent, MutationKind};
use super::temp::ZIPDL_PREFIX;
use super::{entry_bytes, require_dir, require_file, FileSystemDriver};
use crate::connector::response::{ConnectorResponse, ZipDownload};
use crate::driver::archive::{ArchiveEntry, ZIP_MIME};
use crate::volume::attribute::{
    can_copy, can_create, can_delete, can_download, can_edit, can_extract, can_move, can_rename,
};
use crate::volume::{combine, validate_name, PathInfo};
use crate::{ConnectorError, Result};

/// How name collisions in a destination directory are handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictPolicy {
    /// Names that get a fresh unique name instead of replacing.
    pub renames: Vec<String>,
    /// Separator for generated names, `~` when empty.
    pub suffix: String,
    /// `Some(false)` never replaces; otherwise the volume's flag decides.
    pub overwrite: Option<bool>,
}

impl ConflictPolicy {
    fn suffix(&self) -> &str {
        if self.suffix.is_empty() {
            "~"
        } else {
            &self.suffix
        }
    }
}

/// Picture edit requested by `resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Resize { width: u32, height: u32 },
    Crop { x: u32, y: u32, width: u32, height: u32 },
    Rotate { degrees: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeRequest {
    pub mode: ResizeMode,
    /// JPEG quality, 1-100.
    pub quality: u8,
}

/// Where an incoming entry lands.
pub(super) struct Placement {
    pub dest: PathInfo,
    /// Bytes held by the entry being replaced.
    pub overwritten: u64,
}

impl Placement {
    /// Whether an existing entry has to go first.
    pub fn replaces(&self) -> bool {
        self.dest.exists()
    }
}

/// Split `name` into stem and extension (with its dot).
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(index) if index > 0 => name.split_at(index),
        _ => (name, ""),
    }
}

/// First free `stem{separator}{n}.ext` in `dir`.
pub(super) async fn unique_name(dir: &PathInfo, name: &str, separator: &str) -> Result<PathInfo> {
    let (stem, extension) = split_name(name);
    for n in 1..=10_000u32 {
        let candidate = dir
            .child(&format!("{stem}{separator}{n}{extension}"))
            .await?;
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(ConnectorError::Exists(name.to_string()))
}

/// Decide where `name` goes in `dir` under `policy`.
pub(super) async fn place(
    dir: &PathInfo,
    name: &str,
    policy: &ConflictPolicy,
    volume_allows: bool,
    token: &CancellationToken,
) -> Result<Placement> {
    let dest = dir.child(name).await?;
    if !dest.exists() {
        return Ok(Placement {
            dest,
            overwritten: 0,
        });
    }
    if policy.renames.iter().any(|r| r == name) || policy.overwrite == Some(false) {
        return Ok(Placement {
            dest: unique_name(dir, name, policy.suffix()).await?,
            overwritten: 0,
        });
    }
    if !volume_allows {
        return Err(ConnectorError::Exists(name.to_string()));
    }
    if !can_delete(dest.attribute(), dir.attribute()) {
        return Err(ConnectorError::PermissionDenied);
    }
    let overwritten = entry_bytes(&dest, token).await?;
    Ok(Placement { dest, overwritten })
}

/// Remove a file or tree. A missing path is not an error.
pub(super) async fn remove_path(path: &Path) -> io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Copy a file or tree. Returns the bytes copied.
pub(super) async fn copy_tree(
    source: PathBuf,
    dest: PathBuf,
    token: &CancellationToken,
) -> Result<u64> {
    let token = token.clone();
    tokio::task::spawn_blocking(move || {
        if source.is_file() {
            return Ok(std::fs::copy(&source, &dest)?);
        }
        let mut copied = 0;
        for entry in WalkDir::new(&source).sort_by_file_name() {
            if token.is_cancelled() {
                return Err(ConnectorError::ConnectionAborted);
            }
            let entry = entry?;
            let Ok(relative) = entry.path().strip_prefix(&source) else {
                continue;
            };
            let out = dest.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&out)?;
            } else if entry.file_type().is_file() {
                copied += std::fs::copy(entry.path(), &out)?;
            }
        }
        Ok(copied)
    })
    .await?
}

/// Move a file or tree, copying when a plain rename is not possible.
pub(super) async fn move_path(source: &Path, dest: &Path, token: &CancellationToken) -> Result<()> {
    match tokio::fs::rename(source, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e.into()),
        Err(e) => {
            debug!(error = %e, source = %source.display(), "Rename failed, copying instead");
            copy_tree(source.to_path_buf(), dest.to_path_buf(), token).await?;
            remove_path(source).await?;
            Ok(())
        }
    }
}

fn byte_delta(added: u64, removed: u64) -> i64 {
    added as i64 - removed as i64
}

/// Results of a multi-target command.
///
/// Failures become warnings as long as one target succeeded; otherwise the
/// first failure is the command's error. Cancellation always ends the batch.
#[derive(Default)]
pub(super) struct Batch {
    succeeded: usize,
    failures: Vec<ConnectorError>,
}

impl Batch {
    pub fn record<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => {
                self.succeeded += 1;
                Ok(Some(value))
            }
            Err(e) if matches!(e.innermost(), ConnectorError::ConnectionAborted) => Err(e),
            Err(e) => {
                warn!(code = e.code(), error = %e, "Batch item failed");
                self.failures.push(e);
                Ok(None)
            }
        }
    }

    pub fn finish(self, response: &mut ConnectorResponse) -> Result<()> {
        let mut failures = self.failures.into_iter();
        if self.succeeded == 0 {
            if let Some(first) = failures.next() {
                return Err(first);
            }
        }
        for e in failures {
            response.push_warning(e.code(), e.details());
        }
        Ok(())
    }
}

impl FileSystemDriver {
    async fn parent_of(&self, target: &PathInfo) -> Result<PathInfo> {
        target
            .parent()
            .await?
            .ok_or(ConnectorError::PermissionDenied)
    }

    pub(super) async fn make_directories(
        &self,
        target: &PathInfo,
        name: Option<&str>,
        dirs: &[String],
    ) -> Result<ConnectorResponse> {
        require_dir(target)?;
        if !can_create(target.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }
        if name.is_none() && dirs.is_empty() {
            return Err(ConnectorError::CommandParams("mkdir".to_string()));
        }

        let mut added = Vec::new();
        if let Some(name) = name {
            let dir = target.child(name).await?;
            if dir.exists() {
                return Err(ConnectorError::Exists(name.to_string()));
            }
            tokio::fs::create_dir(dir.path()).await?;
            let dir = PathInfo::resolve(target.volume(), dir.path().to_path_buf()).await?;
            added.push(self.describe(&dir).await);
        }

        let mut hashes = BTreeMap::new();
        for relative in dirs {
            for part in relative.split(['/', '\\']).filter(|p| !p.is_empty()) {
                validate_name(part)?;
            }
            let path = combine(target.path(), relative)?;
            target.volume().ensure_within(&path).await?;
            tokio::fs::create_dir_all(&path).await?;
            let dir = PathInfo::resolve(target.volume(), path).await?;
            hashes.insert(relative.clone(), dir.hash().to_string());
            added.push(self.describe(&dir).await);
        }

        Ok(ConnectorResponse {
            added: Some(added),
            hashes: (!hashes.is_empty()).then_some(hashes),
            ..Default::default()
        })
    }

    pub(super) async fn make_file(&self, target: &PathInfo, name: &str) -> Result<ConnectorResponse> {
        require_dir(target)?;
        if !can_create(target.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }
        let file = target.child(name).await?;
        if file.exists() {
            return Err(ConnectorError::Exists(name.to_string()));
        }

        let path = file.path().to_path_buf();
        let event = MutationEvent::new(
            MutationKind::Write,
            HookTarget::new(target.volume(), path.clone(), false),
        );
        self.hooks
            .write
            .run(event, |_| async move {
                tokio::fs::File::create(&path).await?;
                Ok(((), Delta::NONE))
            })
            .await?;

        let file = PathInfo::resolve(target.volume(), file.path().to_path_buf()).await?;
        Ok(ConnectorResponse {
            added: Some(vec![self.describe(&file).await]),
            ..Default::default()
        })
    }

    pub(super) async fn rename_entry(
        &self,
        target: &PathInfo,
        name: &str,
    ) -> Result<ConnectorResponse> {
        if !target.exists() {
            return Err(ConnectorError::FileNotFound);
        }
        if target.is_root() {
            return Err(ConnectorError::PermissionDenied);
        }
        let parent = self.parent_of(target).await?;
        if !can_rename(target.attribute(), parent.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }
        let dest = parent.child(name).await?;
        if dest == *target {
            return Ok(ConnectorResponse {
                added: Some(vec![self.describe(target).await]),
                removed: Some(Vec::new()),
                ..Default::default()
            });
        }
        if dest.exists() {
            return Err(ConnectorError::Exists(name.to_string()));
        }

        let bytes = entry_bytes(target, &CancellationToken::new()).await?;
        let is_dir = target.is_directory();
        let source = target.path().to_path_buf();
        let dest_path = dest.path().to_path_buf();
        let event = MutationEvent::new(
            MutationKind::Move,
            HookTarget::new(target.volume(), dest_path.clone(), is_dir),
        )
        .with_source(HookTarget::new(target.volume(), source.clone(), is_dir))
        .with_incoming(bytes)
        .with_outgoing(bytes);

        self.hooks
            .move_
            .run(event, |_| async move {
                tokio::fs::rename(&source, &dest_path).await?;
                Ok((
                    (),
                    Delta {
                        target: byte_delta(bytes, 0),
                        source: -byte_delta(bytes, 0),
                    },
                ))
            })
            .await?;

        let renamed = PathInfo::resolve(target.volume(), dest.path().to_path_buf()).await?;
        Ok(ConnectorResponse {
            added: Some(vec![self.describe(&renamed).await]),
            removed: Some(vec![target.hash().to_string()]),
            ..Default::default()
        })
    }

    pub(super) async fn remove_entries(
        &self,
        targets: &[PathInfo],
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        let mut response = ConnectorResponse::default();
        let mut removed = Vec::new();
        let mut batch = Batch::default();
        for target in targets {
            if token.is_cancelled() {
                return Err(ConnectorError::ConnectionAborted);
            }
            if batch.record(self.remove_one(target, token).await)?.is_some() {
                removed.push(target.hash().to_string());
            }
        }
        batch.finish(&mut response)?;
        response.removed = Some(removed);
        Ok(response)
    }

    async fn remove_one(&self, target: &PathInfo, token: &CancellationToken) -> Result<()> {
        if !target.exists() {
            return Err(ConnectorError::FileNotFound);
        }
        if target.is_root() {
            return Err(ConnectorError::PermissionDenied);
        }
        let parent = self.parent_of(target).await?;
        if !can_delete(target.attribute(), parent.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }

        let bytes = entry_bytes(target, token).await?;
        let path = target.path().to_path_buf();
        let event = MutationEvent::new(
            MutationKind::Remove,
            HookTarget::new(target.volume(), path.clone(), target.is_directory()),
        )
        .with_outgoing(bytes);

        self.hooks
            .remove
            .run(event, |_| async move {
                remove_path(&path).await?;
                Ok(((), Delta::target(-byte_delta(bytes, 0))))
            })
            .await
    }

    pub(super) async fn paste_entries(
        &self,
        dst: &PathInfo,
        targets: &[PathInfo],
        cut: bool,
        policy: &ConflictPolicy,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        require_dir(dst)?;
        let mut response = ConnectorResponse::default();
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut batch = Batch::default();

        for target in targets {
            if token.is_cancelled() {
                return Err(ConnectorError::ConnectionAborted);
            }
            let result = self.paste_one(dst, target, cut, policy, token).await;
            if let Some(pasted) = batch.record(result)? {
                if pasted != *target {
                    if cut {
                        removed.push(target.hash().to_string());
                    }
                    added.push(self.describe(&pasted).await);
                }
            }
        }

        batch.finish(&mut response)?;
        response.added = Some(added);
        response.removed = Some(removed);
        Ok(response)
    }

    async fn paste_one(
        &self,
        dst: &PathInfo,
        target: &PathInfo,
        cut: bool,
        policy: &ConflictPolicy,
        token: &CancellationToken,
    ) -> Result<PathInfo> {
        if !target.exists() {
            return Err(ConnectorError::FileNotFound);
        }
        let is_dir = target.is_directory();
        if is_dir && dst.path().starts_with(target.path()) {
            return Err(ConnectorError::PermissionDenied);
        }

        let same_dir = target.path().parent() == Some(dst.path());
        if cut {
            if target.is_root() {
                return Err(ConnectorError::PermissionDenied);
            }
            let parent = self.parent_of(target).await?;
            if !can_move(target.attribute(), parent.attribute(), dst.attribute()) {
                return Err(ConnectorError::PermissionDenied);
            }
            if same_dir {
                return Ok(target.clone());
            }
        } else if !can_copy(target.attribute(), dst.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }

        let name = target.name();
        let placement = if same_dir {
            Placement {
                dest: unique_name(dst, &name, policy.suffix()).await?,
                overwritten: 0,
            }
        } else {
            place(dst, &name, policy, dst.volume().copy_overwrite(), token).await?
        };
        // Replacing an ancestor of the source would destroy the source.
        if target.path().starts_with(placement.dest.path()) {
            return Err(ConnectorError::PermissionDenied);
        }

        let bytes = entry_bytes(target, token).await?;
        let replaces = placement.replaces();
        let overwritten = placement.overwritten;
        let source = target.path().to_path_buf();
        let dest = placement.dest.path().to_path_buf();

        let kind = if cut {
            MutationKind::Move
        } else {
            MutationKind::Copy
        };
        let mut event = MutationEvent::new(kind, HookTarget::new(dst.volume(), dest.clone(), is_dir))
            .with_source(HookTarget::new(target.volume(), source.clone(), is_dir))
            .with_incoming(bytes);
        if cut {
            event = event.with_outgoing(bytes);
        }
        if replaces {
            event = event.with_overwritten(overwritten);
        }

        let token = token.clone();
        self.hooks
            .for_kind(kind)
            .run(event, |_| async move {
                if replaces {
                    remove_path(&dest).await?;
                }
                if cut {
                    move_path(&source, &dest, &token).await?;
                    Ok((
                        (),
                        Delta {
                            target: byte_delta(bytes, overwritten),
                            source: -byte_delta(bytes, 0),
                        },
                    ))
                } else {
                    let copied = copy_tree(source, dest, &token).await?;
                    Ok(((), Delta::target(byte_delta(copied, overwritten))))
                }
            })
            .await?;

        PathInfo::resolve(dst.volume(), placement.dest.path().to_path_buf()).await
    }

    pub(super) async fn duplicate_entries(
        &self,
        targets: &[PathInfo],
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        let mut response = ConnectorResponse::default();
        let mut added = Vec::new();
        let mut batch = Batch::default();
        for target in targets {
            if token.is_cancelled() {
                return Err(ConnectorError::ConnectionAborted);
            }
            if let Some(copy) = batch.record(self.duplicate_one(target, token).await)? {
                added.push(self.describe(&copy).await);
            }
        }
        batch.finish(&mut response)?;
        response.added = Some(added);
        Ok(response)
    }

    async fn duplicate_one(&self, target: &PathInfo, token: &CancellationToken) -> Result<PathInfo> {
        if !target.exists() {
            return Err(ConnectorError::FileNotFound);
        }
        if target.is_root() {
            return Err(ConnectorError::PermissionDenied);
        }
        let parent = self.parent_of(target).await?;
        if !can_copy(target.attribute(), parent.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }

        let copy = unique_name(&parent, &target.name(), " copy ").await?;
        let bytes = entry_bytes(target, token).await?;
        let is_dir = target.is_directory();
        let source = target.path().to_path_buf();
        let dest = copy.path().to_path_buf();
        let event = MutationEvent::new(
            MutationKind::Copy,
            HookTarget::new(target.volume(), dest.clone(), is_dir),
        )
        .with_source(HookTarget::new(target.volume(), source.clone(), is_dir))
        .with_incoming(bytes);

        let token = token.clone();
        self.hooks
            .copy
            .run(event, |_| async move {
                let copied = copy_tree(source, dest, &token).await?;
                Ok(((), Delta::target(byte_delta(copied, 0))))
            })
            .await?;

        PathInfo::resolve(target.volume(), copy.path().to_path_buf()).await
    }

    pub(super) async fn write_content(
        &self,
        target: &PathInfo,
        content: &str,
    ) -> Result<ConnectorResponse> {
        require_file(target)?;
        if !can_edit(target.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }

        let bytes = match content
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
        {
            Some((_, data)) => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|_| ConnectorError::CommandParams("put".to_string()))?,
            None => content.as_bytes().to_vec(),
        };

        let previous = target.entry().size();
        let written = bytes.len() as u64;
        let path = target.path().to_path_buf();
        let event = MutationEvent::new(
            MutationKind::Write,
            HookTarget::new(target.volume(), path.clone(), false),
        )
        .with_incoming(written)
        .with_overwritten(previous);

        self.hooks
            .write
            .run(event, |_| async move {
                tokio::fs::write(&path, bytes).await?;
                Ok(((), Delta::target(byte_delta(written, previous))))
            })
            .await?;

        let changed = PathInfo::resolve(target.volume(), target.path().to_path_buf()).await?;
        Ok(ConnectorResponse {
            changed: Some(vec![self.describe(&changed).await]),
            ..Default::default()
        })
    }

    /// Edit a copy in the temp directory so the final size is known before
    /// the hooks decide.
    pub(super) async fn resize_picture(
        &self,
        target: &PathInfo,
        request: ResizeRequest,
    ) -> Result<ConnectorResponse> {
        require_file(target)?;
        if !can_edit(target.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }
        if !self.picture.can_process(target.path()) {
            return Err(ConnectorError::CommandParams("resize".to_string()));
        }

        let extension = target
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let (_, staged) = self.temp.stage("resize-", &extension);
        let result = self.resize_staged(target, &staged, request).await;
        if result.is_err() {
            self.temp.remove(&staged).await;
        }
        result?;

        let changed = PathInfo::resolve(target.volume(), target.path().to_path_buf()).await?;
        Ok(ConnectorResponse {
            changed: Some(vec![self.describe(&changed).await]),
            ..Default::default()
        })
    }

    async fn resize_staged(
        &self,
        target: &PathInfo,
        staged: &Path,
        request: ResizeRequest,
    ) -> Result<()> {
        tokio::fs::copy(target.path(), staged).await?;
        let quality = request.quality.clamp(1, 100);
        match request.mode {
            ResizeMode::Resize { width, height } => {
                self.picture.resize(staged, width, height, quality).await?
            }
            ResizeMode::Crop {
                x,
                y,
                width,
                height,
            } => self.picture.crop(staged, x, y, width, height, quality).await?,
            ResizeMode::Rotate { degrees } => self.picture.rotate(staged, degrees, quality).await?,
        }

        let previous = target.entry().size();
        let resized = tokio::fs::metadata(staged).await?.len();
        let path = target.path().to_path_buf();
        let staged = staged.to_path_buf();
        let event = MutationEvent::new(
            MutationKind::Resize,
            HookTarget::new(target.volume(), path.clone(), false),
        )
        .with_incoming(resized)
        .with_overwritten(previous);

        self.hooks
            .resize
            .run(event, |_| async move {
                move_path(&staged, &path, &CancellationToken::new()).await?;
                Ok(((), Delta::target(byte_delta(resized, previous))))
            })
            .await
    }

    pub(super) async fn create_archive(
        &self,
        targets: &[PathInfo],
        dst: Option<&PathInfo>,
        mime: &str,
        name: Option<&str>,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        let first = targets
            .first()
            .ok_or_else(|| ConnectorError::CommandParams("archive".to_string()))?;
        let extension = self
            .archiver
            .extension(mime)
            .ok_or(ConnectorError::ArchiveType)?;
        let base = first
            .path()
            .parent()
            .map(Path::to_path_buf)
            .ok_or(ConnectorError::PermissionDenied)?;
        for target in targets {
            if !target.exists() {
                return Err(ConnectorError::FileNotFound);
            }
            if !can_download(target.attribute()) {
                return Err(ConnectorError::PermissionDenied);
            }
            if target.path().parent() != Some(base.as_path()) {
                return Err(ConnectorError::CommandParams("archive".to_string()));
            }
        }

        let dir = match dst {
            Some(dst) => dst.clone(),
            None => self.parent_of(first).await?,
        };
        require_dir(&dir)?;
        if !can_create(dir.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }

        let mut archive_name = match name {
            Some(name) => name.to_string(),
            None if targets.len() == 1 => first.name(),
            None => "Archive".to_string(),
        };
        if !archive_name
            .to_lowercase()
            .ends_with(&format!(".{extension}"))
        {
            archive_name = format!("{archive_name}.{extension}");
        }
        let mut dest = dir.child(&archive_name).await?;
        if dest.exists() {
            dest = unique_name(&dir, &archive_name, "~").await?;
        }

        let (_, staged) = self.temp.stage("archive-", extension);
        let sources: Vec<PathBuf> = targets.iter().map(|t| t.path().to_path_buf()).collect();
        let skip = dir.volume().thumbnail_dir().to_path_buf();
        self.archiver
            .create(&base, &sources, &staged, Some(&skip), token)
            .await?;

        let size = match tokio::fs::metadata(&staged).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.temp.remove(&staged).await;
                return Err(e.into());
            }
        };
        let dest_path = dest.path().to_path_buf();
        let event = MutationEvent::new(
            MutationKind::Archive,
            HookTarget::new(dir.volume(), dest_path.clone(), false),
        )
        .with_incoming(size);

        let staged_path = staged.clone();
        let result = self
            .hooks
            .archive
            .run(event, |_| async move {
                move_path(&staged_path, &dest_path, &CancellationToken::new()).await?;
                Ok(((), Delta::target(byte_delta(size, 0))))
            })
            .await;
        if result.is_err() {
            self.temp.remove(&staged).await;
        }
        result?;

        let archive = PathInfo::resolve(dir.volume(), dest.path().to_path_buf()).await?;
        Ok(ConnectorResponse {
            added: Some(vec![self.describe(&archive).await]),
            ..Default::default()
        })
    }

    pub(super) async fn extract_archive(
        &self,
        target: &PathInfo,
        makedir: bool,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        require_file(target)?;
        let mime = mime_guess::from_path(target.path())
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        if !self.archiver.extract_mimes().contains(&mime) {
            return Err(ConnectorError::ArchiveType);
        }
        let parent = self.parent_of(target).await?;
        if !can_extract(target.attribute(), parent.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }

        let entries = self.archiver.entries(target.path()).await?;
        let dest_dir = if makedir {
            let name = target.name();
            let (stem, _) = split_name(&name);
            let dir = parent.child(stem).await?;
            if dir.exists() {
                unique_name(&parent, stem, "~").await?
            } else {
                dir
            }
        } else {
            parent.clone()
        };

        let incoming: u64 = entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();
        let overwritten = if makedir {
            0
        } else {
            self.check_extract_targets(&dest_dir, &entries).await?
        };

        let dest_path = dest_dir.path().to_path_buf();
        let mut event = MutationEvent::new(
            MutationKind::Extract,
            HookTarget::new(parent.volume(), dest_path.clone(), true),
        )
        .with_incoming(incoming);
        if overwritten > 0 {
            event = event.with_overwritten(overwritten);
        }

        let archiver = std::sync::Arc::clone(&self.archiver);
        let archive = target.path().to_path_buf();
        let token = token.clone();
        let top_level = self
            .hooks
            .extract
            .run(event, |_| async move {
                if makedir {
                    tokio::fs::create_dir(&dest_path).await?;
                }
                let top_level = archiver.extract(&archive, &dest_path, &token).await?;
                Ok((top_level, Delta::target(byte_delta(incoming, overwritten))))
            })
            .await?;

        let mut added = Vec::new();
        let created = if makedir {
            vec![dest_dir.path().to_path_buf()]
        } else {
            top_level
        };
        for path in created {
            let info = PathInfo::resolve(parent.volume(), path).await?;
            added.push(self.describe(&info).await);
        }
        Ok(ConnectorResponse {
            added: Some(added),
            ..Default::default()
        })
    }

    /// Check every path an in-place extraction writes to.
    ///
    /// Each path must stay under the root, new entries need a writable parent
    /// and replaced files must be removable and editable. Returns the bytes
    /// that will be overwritten.
    async fn check_extract_targets(
        &self,
        dest_dir: &PathInfo,
        entries: &[ArchiveEntry],
    ) -> Result<u64> {
        let volume = dest_dir.volume();
        let mut overwritten = 0;
        for entry in entries {
            let path = dest_dir.path().join(&entry.path);
            let info = PathInfo::resolve(volume, path).await?;
            let Some(parent) = info.parent().await? else {
                return Err(ConnectorError::PermissionDenied);
            };
            if parent.exists() && !can_create(parent.attribute()) {
                return Err(ConnectorError::PermissionDenied);
            }
            if entry.is_dir || !info.exists() {
                continue;
            }
            if info.is_directory() {
                return Err(ConnectorError::Exists(info.name()));
            }
            if !can_delete(info.attribute(), parent.attribute()) || !can_edit(info.attribute()) {
                return Err(ConnectorError::PermissionDenied);
            }
            overwritten += info.entry().size();
        }
        Ok(overwritten)
    }

    /// Phase one of `zipdl`: pack the targets into the temp directory.
    pub(super) async fn stage_zip(
        &self,
        targets: &[PathInfo],
        token: &CancellationToken,
    ) -> Result<ZipDownload> {
        let first = targets
            .first()
            .ok_or_else(|| ConnectorError::CommandParams("zipdl".to_string()))?;
        let base = first
            .path()
            .parent()
            .map(Path::to_path_buf)
            .ok_or(ConnectorError::PermissionDenied)?;
        for target in targets {
            if !target.exists() {
                return Err(ConnectorError::FileNotFound);
            }
            if !can_download(target.attribute()) {
                return Err(ConnectorError::PermissionDenied);
            }
            if target.path().parent() != Some(base.as_path()) {
                return Err(ConnectorError::CommandParams("zipdl".to_string()));
            }
        }

        let (key, staged) = self.temp.stage(ZIPDL_PREFIX, "zip");
        let sources: Vec<PathBuf> = targets.iter().map(|t| t.path().to_path_buf()).collect();
        let skip = first.volume().thumbnail_dir().to_path_buf();
        self.archiver
            .create(&base, &sources, &staged, Some(&skip), token)
            .await?;

        let name = if targets.len() == 1 {
            first.name()
        } else {
            match first.parent().await? {
                Some(parent) => parent.name(),
                None => "files".to_string(),
            }
        };
        debug!(key = %key, targets = targets.len(), "Staged zip download");
        Ok(ZipDownload {
            file: key,
            name: format!("{name}.zip"),
            mime: ZIP_MIME.to_string(),
        })
    }
}
