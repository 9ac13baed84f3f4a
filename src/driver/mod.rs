//! File-system driver.
//!
//! [`Driver`] is the seam the connector dispatches to. [`FileSystemDriver`]
//! implements it over local directories. Every mutation runs through the
//! matching list in [`DriverHooks`], so quota, thumbnail and audit policies
//! observe (and may veto) it without knowing about each other.

pub mod archive;
pub mod hooks;
mod ops;
pub mod picture;
pub mod temp;
pub mod thumbnail;
mod upload;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

use crate::connector::response::{
    ArchiverOptions, ConnectorResponse, FileDescriptor, FileResult, VolumeOptions, ZipDownload,
};
use crate::volume::attribute::can_download;
use crate::volume::{PathInfo, Volume};
use crate::{ConnectorError, Result};

use self::archive::{Archiver, ZipArchiver};
use self::hooks::DriverHooks;
use self::picture::{ImageEditor, PictureEditor};
use self::temp::TempStore;
use self::thumbnail::ThumbnailService;

pub use self::ops::{ConflictPolicy, ResizeMode, ResizeRequest};
pub use self::upload::{is_chunk_part, ChunkUpload, UploadFile, UploadRequest};

/// Operations the connector dispatches to.
///
/// Targets arrive already resolved; the driver checks existence, kind and
/// permissions itself.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Volumes served by this driver, in configuration order.
    fn volumes(&self) -> &[Arc<Volume>];

    /// Hook lists for every mutating operation.
    fn hooks(&self) -> &DriverHooks;

    /// Resolve a hash token to a target.
    async fn resolve(&self, hash: &str) -> Result<PathInfo>;

    /// Descriptor of an entry as sent to clients.
    async fn descriptor(&self, info: &PathInfo) -> FileDescriptor;

    /// Capabilities of a directory.
    fn options(&self, dir: &PathInfo) -> VolumeOptions;

    async fn open(&self, target: &PathInfo, tree: bool) -> Result<ConnectorResponse>;
    async fn ls(&self, target: &PathInfo, intersect: &[String]) -> Result<ConnectorResponse>;
    async fn tree(&self, target: &PathInfo) -> Result<ConnectorResponse>;
    async fn parents(
        &self,
        target: &PathInfo,
        until: Option<&PathInfo>,
    ) -> Result<ConnectorResponse>;
    async fn info(&self, targets: &[PathInfo]) -> Result<ConnectorResponse>;
    async fn mkdir(
        &self,
        target: &PathInfo,
        name: Option<&str>,
        dirs: &[String],
    ) -> Result<ConnectorResponse>;
    async fn mkfile(&self, target: &PathInfo, name: &str) -> Result<ConnectorResponse>;
    async fn rename(&self, target: &PathInfo, name: &str) -> Result<ConnectorResponse>;
    async fn rm(&self, targets: &[PathInfo], token: &CancellationToken)
        -> Result<ConnectorResponse>;
    async fn paste(
        &self,
        dst: &PathInfo,
        targets: &[PathInfo],
        cut: bool,
        policy: &ConflictPolicy,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse>;
    async fn duplicate(
        &self,
        targets: &[PathInfo],
        token: &CancellationToken,
    ) -> Result<ConnectorResponse>;
    async fn get(&self, target: &PathInfo) -> Result<ConnectorResponse>;
    async fn put(&self, target: &PathInfo, content: &str) -> Result<ConnectorResponse>;
    async fn upload(
        &self,
        target: &PathInfo,
        request: UploadRequest,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse>;
    async fn upload_chunk(
        &self,
        target: &PathInfo,
        chunk: ChunkUpload,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse>;
    async fn commit_chunk(
        &self,
        target: &PathInfo,
        key: &str,
        name: &str,
        policy: &ConflictPolicy,
    ) -> Result<ConnectorResponse>;
    async fn size(&self, targets: &[PathInfo], token: &CancellationToken)
        -> Result<ConnectorResponse>;
    async fn dim(&self, target: &PathInfo) -> Result<ConnectorResponse>;
    async fn resize(&self, target: &PathInfo, request: ResizeRequest) -> Result<ConnectorResponse>;
    async fn archive(
        &self,
        targets: &[PathInfo],
        dst: Option<&PathInfo>,
        mime: &str,
        name: Option<&str>,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse>;
    async fn extract(
        &self,
        target: &PathInfo,
        makedir: bool,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse>;
    async fn search(
        &self,
        target: &PathInfo,
        query: &str,
        mimes: &[String],
        token: &CancellationToken,
    ) -> Result<Vec<FileDescriptor>>;
    async fn tmb(&self, targets: &[PathInfo]) -> Result<ConnectorResponse>;
    async fn zipdl(&self, targets: &[PathInfo], token: &CancellationToken) -> Result<ZipDownload>;
    async fn zipdl_file(&self, key: &str, name: &str, mime: &str) -> Result<FileResult>;
    async fn file(&self, target: &PathInfo, download: bool) -> Result<FileResult>;
    /// Thumbnail of a file, `None` when none can be made.
    async fn thumbnail(&self, target: &PathInfo) -> Result<Option<FileResult>>;
}

/// Byte and entry counts of a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub size: u64,
    pub files: u64,
    pub dirs: u64,
}

/// Walk `root` counting bytes, files and directories.
///
/// The root itself is not counted as a directory. Stops with
/// `ConnectionAborted` once `token` is cancelled.
pub(crate) async fn tree_stats(
    root: PathBuf,
    skip: Option<PathBuf>,
    token: CancellationToken,
) -> Result<TreeStats> {
    tokio::task::spawn_blocking(move || {
        let mut stats = TreeStats::default();
        let walker = WalkDir::new(&root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| skip.as_deref().map_or(true, |s| !e.path().starts_with(s)));
        for entry in walker {
            if token.is_cancelled() {
                return Err(ConnectorError::ConnectionAborted);
            }
            let entry = entry?;
            if entry.file_type().is_dir() {
                stats.dirs += 1;
            } else if entry.file_type().is_file() {
                stats.files += 1;
                stats.size += entry.metadata()?.len();
            }
        }
        if root.is_file() {
            stats.files = 1;
            stats.size = std::fs::metadata(&root)?.len();
        }
        Ok(stats)
    })
    .await?
}

/// Bytes held by an entry: file length or tree total.
pub(crate) async fn entry_bytes(info: &PathInfo, token: &CancellationToken) -> Result<u64> {
    if !info.exists() {
        return Ok(0);
    }
    if !info.is_directory() {
        return Ok(info.entry().size());
    }
    let skip = info.volume().thumbnail_dir().to_path_buf();
    Ok(tree_stats(info.path().to_path_buf(), Some(skip), token.clone())
        .await?
        .size)
}

fn require_dir(info: &PathInfo) -> Result<()> {
    if !info.exists() || !info.is_directory() {
        return Err(ConnectorError::FolderNotFound);
    }
    Ok(())
}

fn require_file(info: &PathInfo) -> Result<()> {
    if !info.exists() {
        return Err(ConnectorError::FileNotFound);
    }
    if info.is_directory() {
        return Err(ConnectorError::NotFile);
    }
    Ok(())
}

fn require_read(info: &PathInfo) -> Result<()> {
    if !info.attribute().read() {
        return Err(ConnectorError::PermissionDenied);
    }
    Ok(())
}

/// Driver over local directories.
pub struct FileSystemDriver {
    volumes: Vec<Arc<Volume>>,
    hooks: DriverHooks,
    archiver: Arc<dyn Archiver>,
    picture: Arc<dyn PictureEditor>,
    thumbnails: Arc<ThumbnailService>,
    temp: Arc<TempStore>,
    disabled: Vec<String>,
}

impl std::fmt::Debug for FileSystemDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemDriver")
            .field("volumes", &self.volumes.iter().map(|v| v.id()).collect::<Vec<_>>())
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl FileSystemDriver {
    pub fn new(
        volumes: Vec<Arc<Volume>>,
        temp: Arc<TempStore>,
        thumbnails: Arc<ThumbnailService>,
    ) -> Self {
        Self {
            volumes,
            hooks: DriverHooks::default(),
            archiver: Arc::new(ZipArchiver::new()),
            picture: Arc::new(ImageEditor::new()),
            thumbnails,
            temp,
            disabled: Vec::new(),
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_picture_editor(mut self, picture: Arc<dyn PictureEditor>) -> Self {
        self.picture = picture;
        self
    }

    /// Commands reported as disabled in `options`.
    pub fn with_disabled(mut self, disabled: Vec<String>) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn temp(&self) -> &Arc<TempStore> {
        &self.temp
    }

    /// Volume owning a hash; the longest matching id wins.
    fn volume_of(&self, hash: &str) -> Result<&Arc<Volume>> {
        self.volumes
            .iter()
            .filter(|v| v.owns_hash(hash))
            .max_by_key(|v| v.id().len())
            .ok_or(ConnectorError::FileNotFound)
    }

    /// Visible children of a directory, sorted by name.
    async fn children(&self, dir: &PathInfo) -> Result<Vec<PathInfo>> {
        let volume = dir.volume();
        let mut entries = tokio::fs::read_dir(dir.path()).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if volume.is_hidden_path(&path) {
                continue;
            }
            match PathInfo::resolve(volume, path).await {
                Ok(info) if info.attribute().visible() => children.push(info),
                Ok(_) => {}
                // Symlinks leaving the root are not listed.
                Err(ConnectorError::PermissionDenied) => {}
                Err(e) => return Err(e),
            }
        }
        children.sort_by_key(|c| c.name());
        Ok(children)
    }

    async fn subdirectories(&self, dir: &PathInfo) -> Result<Vec<FileDescriptor>> {
        let mut tree = Vec::new();
        for child in self.children(dir).await? {
            if child.is_directory() {
                tree.push(self.describe(&child).await);
            }
        }
        Ok(tree)
    }

    async fn has_subdirectories(&self, dir: &PathInfo) -> bool {
        let volume = dir.volume();
        let Ok(mut entries) = tokio::fs::read_dir(dir.path()).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && !volume.is_hidden_path(&path) && volume.attribute(&path, true).visible() {
                return true;
            }
        }
        false
    }

    fn thumbnail_marker(&self, info: &PathInfo) -> Option<String> {
        if !info.attribute().read() || self.thumbnails.media_kind(info.path()).is_none() {
            return None;
        }
        let thumbnail = info.volume().thumbnail_path(info.path()).ok()?;
        if thumbnail.is_file() {
            thumbnail
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        } else {
            // Client asks for it with `tmb`.
            Some("1".to_string())
        }
    }

    async fn describe(&self, info: &PathInfo) -> FileDescriptor {
        let descriptor = FileDescriptor::from_info(info);
        if info.is_directory() {
            let dirs = self.has_subdirectories(info).await;
            descriptor.with_dirs(dirs)
        } else {
            descriptor.with_tmb(self.thumbnail_marker(info))
        }
    }

    async fn describe_all(&self, infos: &[PathInfo]) -> Vec<FileDescriptor> {
        let mut descriptors = Vec::with_capacity(infos.len());
        for info in infos {
            descriptors.push(self.describe(info).await);
        }
        descriptors
    }

    fn volume_options(&self, dir: &PathInfo) -> VolumeOptions {
        let volume = dir.volume();
        let path = if dir.is_root() {
            volume.name().to_string()
        } else {
            format!("{}{}", volume.name(), dir.relative())
        };
        VolumeOptions {
            path,
            url: volume.url().unwrap_or_default().to_string(),
            tmb_url: volume.thumbnail_url().unwrap_or_default().to_string(),
            separator: volume.separator().to_string(),
            disabled: self.disabled.clone(),
            copy_overwrite: volume.copy_overwrite(),
            upload_overwrite: volume.upload_overwrite(),
            upload_max_size: volume.max_upload_size().unwrap_or(0),
            archivers: ArchiverOptions {
                create: self.archiver.create_mimes(),
                extract: self.archiver.extract_mimes(),
            },
        }
    }

    async fn search_tree(
        &self,
        target: &PathInfo,
        query: &str,
        mimes: &[String],
        token: &CancellationToken,
    ) -> Result<Vec<FileDescriptor>> {
        require_dir(target)?;
        require_read(target)?;

        let needle = query.to_lowercase();
        let root = target.path().to_path_buf();
        let skip = target.volume().thumbnail_dir().to_path_buf();
        let walk_token = token.clone();
        let matches: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            let walker = WalkDir::new(&root)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !e.path().starts_with(&skip));
            for entry in walker {
                if walk_token.is_cancelled() {
                    return Err(ConnectorError::ConnectionAborted);
                }
                let entry = entry?;
                if entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains(&needle)
                {
                    found.push(entry.into_path());
                }
            }
            Ok(found)
        })
        .await??;

        let mut files = Vec::new();
        for path in matches {
            let info = match PathInfo::resolve(target.volume(), path).await {
                Ok(info) => info,
                Err(ConnectorError::PermissionDenied) => continue,
                Err(e) => return Err(e),
            };
            if !info.attribute().visible() {
                continue;
            }
            let descriptor = self.describe(&info).await;
            if !mimes.is_empty() && !mimes.iter().any(|m| descriptor.mime.starts_with(m.as_str()))
            {
                continue;
            }
            files.push(descriptor);
        }
        Ok(files)
    }

    async fn read_content(&self, target: &PathInfo) -> Result<ConnectorResponse> {
        require_file(target)?;
        if !can_download(target.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }
        let bytes = tokio::fs::read(target.path()).await?;
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                let mime = mime_guess::from_path(target.path()).first_or_octet_stream();
                let encoded = base64::engine::general_purpose::STANDARD.encode(e.into_bytes());
                format!("data:{};base64,{}", mime.essence_str(), encoded)
            }
        };
        Ok(ConnectorResponse {
            content: Some(content),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Driver for FileSystemDriver {
    fn volumes(&self) -> &[Arc<Volume>] {
        &self.volumes
    }

    fn hooks(&self) -> &DriverHooks {
        &self.hooks
    }

    async fn resolve(&self, hash: &str) -> Result<PathInfo> {
        let volume = self.volume_of(hash)?;
        let path = volume.decode_hash(hash)?;
        PathInfo::resolve(volume, path).await
    }

    async fn descriptor(&self, info: &PathInfo) -> FileDescriptor {
        self.describe(info).await
    }

    fn options(&self, dir: &PathInfo) -> VolumeOptions {
        self.volume_options(dir)
    }

    async fn open(&self, target: &PathInfo, tree: bool) -> Result<ConnectorResponse> {
        require_dir(target)?;
        require_read(target)?;

        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for descriptor in self.describe_all(&self.children(target).await?).await {
            seen.insert(descriptor.hash.clone());
            files.push(descriptor);
        }
        if tree {
            let response = self.parents(target, None).await?;
            for descriptor in response.tree.unwrap_or_default() {
                if seen.insert(descriptor.hash.clone()) {
                    files.push(descriptor);
                }
            }
        }

        Ok(ConnectorResponse {
            cwd: Some(self.describe(target).await),
            files: Some(files),
            options: Some(self.volume_options(target)),
            ..Default::default()
        })
    }

    async fn ls(&self, target: &PathInfo, intersect: &[String]) -> Result<ConnectorResponse> {
        require_dir(target)?;
        require_read(target)?;
        let list: BTreeMap<String, String> = self
            .children(target)
            .await?
            .into_iter()
            .map(|c| (c.hash().to_string(), c.name()))
            .filter(|(_, name)| intersect.is_empty() || intersect.contains(name))
            .collect();
        Ok(ConnectorResponse {
            list: Some(list),
            ..Default::default()
        })
    }

    async fn tree(&self, target: &PathInfo) -> Result<ConnectorResponse> {
        require_dir(target)?;
        require_read(target)?;
        Ok(ConnectorResponse {
            tree: Some(self.subdirectories(target).await?),
            ..Default::default()
        })
    }

    async fn parents(
        &self,
        target: &PathInfo,
        until: Option<&PathInfo>,
    ) -> Result<ConnectorResponse> {
        require_dir(target)?;
        let mut tree = Vec::new();
        let mut current = target.clone();
        loop {
            if current.attribute().read() {
                tree.extend(self.subdirectories(&current).await?);
            }
            if until.is_some_and(|u| *u == current) {
                break;
            }
            match current.parent().await? {
                Some(parent) => current = parent,
                None => {
                    tree.push(self.describe(&current).await);
                    break;
                }
            }
        }
        Ok(ConnectorResponse {
            tree: Some(tree),
            ..Default::default()
        })
    }

    async fn info(&self, targets: &[PathInfo]) -> Result<ConnectorResponse> {
        let mut files = Vec::new();
        for target in targets.iter().filter(|t| t.exists() && t.attribute().visible()) {
            files.push(self.describe(target).await);
        }
        Ok(ConnectorResponse {
            files: Some(files),
            ..Default::default()
        })
    }

    async fn mkdir(
        &self,
        target: &PathInfo,
        name: Option<&str>,
        dirs: &[String],
    ) -> Result<ConnectorResponse> {
        self.make_directories(target, name, dirs).await
    }

    async fn mkfile(&self, target: &PathInfo, name: &str) -> Result<ConnectorResponse> {
        self.make_file(target, name).await
    }

    async fn rename(&self, target: &PathInfo, name: &str) -> Result<ConnectorResponse> {
        self.rename_entry(target, name).await
    }

    async fn rm(
        &self,
        targets: &[PathInfo],
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        self.remove_entries(targets, token).await
    }

    async fn paste(
        &self,
        dst: &PathInfo,
        targets: &[PathInfo],
        cut: bool,
        policy: &ConflictPolicy,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        self.paste_entries(dst, targets, cut, policy, token).await
    }

    async fn duplicate(
        &self,
        targets: &[PathInfo],
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        self.duplicate_entries(targets, token).await
    }

    async fn get(&self, target: &PathInfo) -> Result<ConnectorResponse> {
        self.read_content(target).await
    }

    async fn put(&self, target: &PathInfo, content: &str) -> Result<ConnectorResponse> {
        self.write_content(target, content).await
    }

    async fn upload(
        &self,
        target: &PathInfo,
        request: UploadRequest,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        self.upload_files(target, request, token).await
    }

    async fn upload_chunk(
        &self,
        target: &PathInfo,
        chunk: ChunkUpload,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        self.store_chunk(target, chunk, token).await
    }

    async fn commit_chunk(
        &self,
        target: &PathInfo,
        key: &str,
        name: &str,
        policy: &ConflictPolicy,
    ) -> Result<ConnectorResponse> {
        self.merge_chunks(target, key, name, policy).await
    }

    async fn size(
        &self,
        targets: &[PathInfo],
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        let mut total = TreeStats::default();
        let mut sizes = BTreeMap::new();
        for target in targets {
            if !target.exists() {
                return Err(ConnectorError::FileNotFound);
            }
            require_read(target)?;
            let stats = if target.is_directory() {
                let skip = target.volume().thumbnail_dir().to_path_buf();
                let mut stats =
                    tree_stats(target.path().to_path_buf(), Some(skip), token.clone()).await?;
                stats.dirs += 1;
                stats
            } else {
                TreeStats {
                    size: target.entry().size(),
                    files: 1,
                    dirs: 0,
                }
            };
            sizes.insert(target.hash().to_string(), stats.size);
            total.size += stats.size;
            total.files += stats.files;
            total.dirs += stats.dirs;
        }
        Ok(ConnectorResponse {
            size: Some(total.size),
            file_cnt: Some(total.files),
            dir_cnt: Some(total.dirs),
            sizes: Some(sizes),
            ..Default::default()
        })
    }

    async fn dim(&self, target: &PathInfo) -> Result<ConnectorResponse> {
        require_file(target)?;
        require_read(target)?;
        if !self.picture.can_process(target.path()) {
            return Err(ConnectorError::CommandParams("dim".to_string()));
        }
        let (width, height) = self.picture.dimensions(target.path()).await?;
        Ok(ConnectorResponse {
            dim: Some(format!("{width}x{height}")),
            ..Default::default()
        })
    }

    async fn resize(&self, target: &PathInfo, request: ResizeRequest) -> Result<ConnectorResponse> {
        self.resize_picture(target, request).await
    }

    async fn archive(
        &self,
        targets: &[PathInfo],
        dst: Option<&PathInfo>,
        mime: &str,
        name: Option<&str>,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        self.create_archive(targets, dst, mime, name, token).await
    }

    async fn extract(
        &self,
        target: &PathInfo,
        makedir: bool,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        self.extract_archive(target, makedir, token).await
    }

    async fn search(
        &self,
        target: &PathInfo,
        query: &str,
        mimes: &[String],
        token: &CancellationToken,
    ) -> Result<Vec<FileDescriptor>> {
        self.search_tree(target, query, mimes, token).await
    }

    async fn tmb(&self, targets: &[PathInfo]) -> Result<ConnectorResponse> {
        let mut images = BTreeMap::new();
        for target in targets {
            if !target.exists() || target.is_directory() || !target.attribute().read() {
                continue;
            }
            match self.thumbnails.render(target.volume(), target.path()).await {
                Ok(Some(name)) => {
                    images.insert(target.hash().to_string(), name);
                }
                Ok(None) => {}
                Err(e) => warn!(path = %target.path().display(), error = %e, "Thumbnail failed"),
            }
        }
        Ok(ConnectorResponse {
            images: Some(images),
            ..Default::default()
        })
    }

    async fn zipdl(&self, targets: &[PathInfo], token: &CancellationToken) -> Result<ZipDownload> {
        self.stage_zip(targets, token).await
    }

    async fn zipdl_file(&self, key: &str, name: &str, mime: &str) -> Result<FileResult> {
        let path = self.temp.staged(temp::ZIPDL_PREFIX, key, "zip")?;
        let name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{key}.zip"));
        Ok(FileResult {
            path,
            name,
            mime: mime.to_string(),
            attachment: true,
            delete_after: true,
        })
    }

    async fn file(&self, target: &PathInfo, download: bool) -> Result<FileResult> {
        require_file(target)?;
        if !can_download(target.attribute()) {
            return Err(ConnectorError::PermissionDenied);
        }
        Ok(FileResult {
            path: target.path().to_path_buf(),
            name: target.name(),
            mime: mime_guess::from_path(target.path())
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            attachment: download,
            delete_after: false,
        })
    }

    async fn thumbnail(&self, target: &PathInfo) -> Result<Option<FileResult>> {
        require_file(target)?;
        require_read(target)?;
        let volume = target.volume();
        let path = volume.thumbnail_path(target.path())?;
        if !path.is_file() {
            match self.thumbnails.render(volume, target.path()).await? {
                Some(_) => {}
                None => return Ok(None),
            }
        }
        Ok(Some(FileResult {
            name: volume.thumbnail_name(target.path())?,
            path,
            mime: "image/png".to_string(),
            attachment: false,
            delete_after: false,
        }))
    }
}
