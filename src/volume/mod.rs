//! Volumes: named roots exposed as one addressable namespace each.
//!
//! A [`Volume`] binds a backing directory to an id prefix, a public URL, a
//! thumbnail directory and the upload/ACL policy. It translates between
//! absolute backing paths, relative paths (`/dir/name`) and hash tokens
//! (`id + encode(relative)`).

pub mod attribute;

use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::codec::PathCodec;
use crate::config::{volume_id, VolumeConfig};
use crate::{ConnectorError, Result};

pub use attribute::{
    AttributeOverrides, AttributeResolver, FilteredObjectAttribute, ObjectAttribute, RuleSubject,
};

/// Default thumbnail directory name inside a volume root.
pub const THUMBNAIL_DIR_NAME: &str = ".tmb";

/// A named root directory.
#[derive(Debug, Clone)]
pub struct Volume {
    id: String,
    root: PathBuf,
    name: String,
    url: Option<String>,
    thumbnail_url: Option<String>,
    thumbnail_dir: PathBuf,
    separator: char,
    max_upload_size: Option<u64>,
    max_storage: Option<u64>,
    upload_overwrite: bool,
    copy_overwrite: bool,
    upload_allow: Vec<String>,
    upload_deny: Vec<String>,
    resolver: AttributeResolver,
    codec: PathCodec,
}

impl Volume {
    /// Create a volume rooted at `root`.
    ///
    /// The root directory is created if it doesn't exist and stored in
    /// canonical form so containment checks see through symlinked parents.
    pub fn new(id: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Files".to_string());

        Ok(Self {
            id: id.into(),
            thumbnail_dir: root.join(THUMBNAIL_DIR_NAME),
            root,
            name,
            url: None,
            thumbnail_url: None,
            separator: '/',
            max_upload_size: None,
            max_storage: None,
            upload_overwrite: true,
            copy_overwrite: true,
            upload_allow: Vec::new(),
            upload_deny: Vec::new(),
            resolver: AttributeResolver::default(),
            codec: PathCodec::new(),
        })
    }

    /// Build the volume at position `index` of the configuration.
    pub fn from_config(config: &VolumeConfig, index: usize) -> Result<Self> {
        let mut default = ObjectAttribute::default();
        default.apply(&AttributeOverrides::from(&config.default_attribute));
        let mut resolver =
            AttributeResolver::new(default, config.read_only, config.locked, config.show_only);
        for rule in &config.rules {
            resolver.push_rule(FilteredObjectAttribute::from_config(rule)?);
        }

        let mut volume = Self::new(volume_id(config, index), &config.root)?
            .with_resolver(resolver)
            .with_separator(config.separator)
            .with_overwrite(config.upload_overwrite, config.copy_overwrite)
            .with_upload_filter(config.upload_allow.clone(), config.upload_deny.clone());
        volume.url = config.url.clone();
        volume.thumbnail_url = config.thumbnail_url.clone();
        volume.max_upload_size = config.max_upload_size;
        volume.max_storage = config.max_storage;
        if let Some(name) = &config.name {
            volume.name = name.clone();
        }
        if let Some(dir) = &config.thumbnail_dir {
            volume.thumbnail_dir = volume.root.join(dir);
        }
        Ok(volume)
    }

    /// Set the display name of the root.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the public URL of the root.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the maximum storage quota in bytes.
    pub fn with_max_storage(mut self, bytes: u64) -> Self {
        self.max_storage = Some(bytes);
        self
    }

    /// Set the maximum upload size in bytes.
    pub fn with_max_upload_size(mut self, bytes: u64) -> Self {
        self.max_upload_size = Some(bytes);
        self
    }

    /// Set the attribute resolver (default attribute, flags and rules).
    pub fn with_resolver(mut self, resolver: AttributeResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set the wire path separator.
    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    /// Set upload and paste overwrite behavior.
    pub fn with_overwrite(mut self, upload: bool, copy: bool) -> Self {
        self.upload_overwrite = upload;
        self.copy_overwrite = copy;
        self
    }

    /// Set upload mime allow and deny lists.
    pub fn with_upload_filter(mut self, allow: Vec<String>, deny: Vec<String>) -> Self {
        self.upload_allow = allow;
        self.upload_deny = deny;
        self
    }

    /// Set the hash codec.
    pub fn with_codec(mut self, codec: PathCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Move the thumbnail directory.
    pub fn with_thumbnail_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.thumbnail_dir = dir.into();
        self
    }

    /// Volume id prefix.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Display name of the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Public URL of the root.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Public URL of the thumbnail directory.
    pub fn thumbnail_url(&self) -> Option<&str> {
        self.thumbnail_url.as_deref()
    }

    /// Thumbnail directory.
    pub fn thumbnail_dir(&self) -> &Path {
        &self.thumbnail_dir
    }

    /// Wire path separator.
    pub fn separator(&self) -> char {
        self.separator
    }

    /// Maximum upload size in bytes.
    pub fn max_upload_size(&self) -> Option<u64> {
        self.max_upload_size
    }

    /// Maximum storage quota in bytes.
    pub fn max_storage(&self) -> Option<u64> {
        self.max_storage
    }

    /// Uploads may overwrite existing files.
    pub fn upload_overwrite(&self) -> bool {
        self.upload_overwrite
    }

    /// Paste may overwrite existing entries.
    pub fn copy_overwrite(&self) -> bool {
        self.copy_overwrite
    }

    /// Key identifying this volume's storage counter.
    pub fn storage_key(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    /// Whether `path` lies under this volume's root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Whether `path` is this volume's root.
    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }

    /// Whether `path` is internal bookkeeping hidden from clients.
    pub fn is_hidden_path(&self, path: &Path) -> bool {
        path.starts_with(&self.thumbnail_dir)
    }

    /// Relative path of an absolute path (`/` for the root).
    pub fn relative_path(&self, path: &Path) -> Result<String> {
        let rest = path
            .strip_prefix(&self.root)
            .map_err(|_| ConnectorError::PermissionDenied)?;
        let mut relative = String::new();
        for component in rest.components() {
            match component {
                Component::Normal(part) => {
                    relative.push(self.separator);
                    relative.push_str(&part.to_string_lossy());
                }
                _ => return Err(ConnectorError::PermissionDenied),
            }
        }
        if relative.is_empty() {
            relative.push(self.separator);
        }
        Ok(relative)
    }

    /// Hash token of an absolute path.
    pub fn hash_of(&self, path: &Path) -> Result<String> {
        Ok(format!("{}{}", self.id, self.codec.encode(&self.relative_path(path)?)))
    }

    /// Whether a hash token belongs to this volume.
    pub fn owns_hash(&self, hash: &str) -> bool {
        hash.starts_with(&self.id)
    }

    /// Absolute path of a hash token.
    ///
    /// Fails with `PermissionDenied` when the decoded path would leave the root.
    pub fn decode_hash(&self, hash: &str) -> Result<PathBuf> {
        let token = hash
            .strip_prefix(self.id.as_str())
            .ok_or(ConnectorError::FileNotFound)?;
        let relative = self.codec.decode(token)?;
        combine(&self.root, &relative)
    }

    /// Effective attribute of an entry.
    pub fn attribute(&self, path: &Path, is_dir: bool) -> ObjectAttribute {
        let relative = self
            .relative_path(path)
            .unwrap_or_else(|_| self.separator.to_string());
        self.resolver.resolve(&RuleSubject {
            relative: &relative,
            path,
            is_dir,
        })
    }

    /// Stat `path` and compute its attribute.
    pub async fn entry(&self, path: PathBuf) -> Result<FsEntry> {
        if !self.contains(&path) {
            return Err(ConnectorError::PermissionDenied);
        }
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                if let Ok(canonical) = tokio::fs::canonicalize(&path).await {
                    if !canonical.starts_with(&self.root) {
                        return Err(ConnectorError::PermissionDenied);
                    }
                }
                let is_dir = meta.is_dir();
                Ok(FsEntry {
                    attribute: self.attribute(&path, is_dir),
                    size: if is_dir { 0 } else { meta.len() },
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    exists: true,
                    is_dir,
                    path,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.ensure_within(&path).await?;
                Ok(FsEntry {
                    attribute: self.attribute(&path, false),
                    size: 0,
                    modified: None,
                    exists: false,
                    is_dir: false,
                    path,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check that `path`, existing or not, stays under the root once
    /// symlinks are followed.
    ///
    /// The deepest existing ancestor is canonicalized. A dangling symlink on
    /// the way is rejected since creating through it would land elsewhere.
    pub async fn ensure_within(&self, path: &Path) -> Result<()> {
        if !self.contains(path) {
            return Err(ConnectorError::PermissionDenied);
        }
        let mut current = path;
        loop {
            match tokio::fs::canonicalize(current).await {
                Ok(canonical) if canonical.starts_with(&self.root) => return Ok(()),
                Ok(_) => return Err(ConnectorError::PermissionDenied),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if tokio::fs::symlink_metadata(current).await.is_ok() {
                        return Err(ConnectorError::PermissionDenied);
                    }
                    current = current.parent().ok_or(ConnectorError::PermissionDenied)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Thumbnail file for an entry.
    pub fn thumbnail_path(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.thumbnail_dir.join(self.thumbnail_name(path)?))
    }

    /// Thumbnail file name for an entry: digest of the relative path.
    pub fn thumbnail_name(&self, path: &Path) -> Result<String> {
        let relative = self.relative_path(path)?;
        let digest = Sha256::digest(relative.as_bytes());
        Ok(format!("{:x}.png", digest))
    }

    /// Whether a file with this name may be uploaded.
    pub fn upload_allowed(&self, name: &str) -> bool {
        let mime = mime_guess::from_path(name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let matches = |pattern: &String| {
            pattern == "all" || mime == *pattern || (pattern.ends_with('/') && mime.starts_with(pattern.as_str()))
        };

        if self.upload_deny.iter().any(matches) {
            return false;
        }
        self.upload_allow.is_empty() || self.upload_allow.iter().any(matches)
    }
}

/// One file-system entry with its attribute, resolved once per request.
#[derive(Debug, Clone)]
pub struct FsEntry {
    path: PathBuf,
    is_dir: bool,
    exists: bool,
    size: u64,
    modified: Option<DateTime<Utc>>,
    attribute: ObjectAttribute,
}

impl FsEntry {
    /// Absolute backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Whether the entry exists.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// File size in bytes, 0 for directories.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time.
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    /// Effective attribute.
    pub fn attribute(&self) -> &ObjectAttribute {
        &self.attribute
    }

    /// Last path component.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A resolved command target.
///
/// Equality and hashing are defined by the hash token.
#[derive(Debug, Clone)]
pub struct PathInfo {
    volume: Arc<Volume>,
    relative: String,
    hash: String,
    entry: FsEntry,
}

impl PathInfo {
    /// Resolve an absolute path inside `volume`.
    pub async fn resolve(volume: &Arc<Volume>, path: PathBuf) -> Result<Self> {
        let relative = volume.relative_path(&path)?;
        let hash = volume.hash_of(&path)?;
        let entry = volume.entry(path).await?;
        Ok(Self {
            volume: Arc::clone(volume),
            relative,
            hash,
            entry,
        })
    }

    /// Owning volume.
    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// Relative path.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Hash token.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Resolved entry.
    pub fn entry(&self) -> &FsEntry {
        &self.entry
    }

    /// Absolute backing path.
    pub fn path(&self) -> &Path {
        self.entry.path()
    }

    /// Last path component, or the volume name for the root.
    pub fn name(&self) -> String {
        if self.is_root() {
            self.volume.name().to_string()
        } else {
            self.entry.name()
        }
    }

    /// Effective attribute.
    pub fn attribute(&self) -> &ObjectAttribute {
        self.entry.attribute()
    }

    /// Whether the target is a directory.
    pub fn is_directory(&self) -> bool {
        self.entry.is_dir()
    }

    /// Whether the target is the volume root.
    pub fn is_root(&self) -> bool {
        self.volume.is_root(self.entry.path())
    }

    /// Whether the target exists.
    pub fn exists(&self) -> bool {
        self.entry.exists()
    }

    /// Parent directory, `None` for the root.
    pub async fn parent(&self) -> Result<Option<PathInfo>> {
        if self.is_root() {
            return Ok(None);
        }
        match self.path().parent() {
            Some(parent) => Ok(Some(Self::resolve(&self.volume, parent.to_path_buf()).await?)),
            None => Ok(None),
        }
    }

    /// Hash of the parent directory, `None` for the root.
    pub fn parent_hash(&self) -> Option<String> {
        if self.is_root() {
            return None;
        }
        self.path()
            .parent()
            .and_then(|p| self.volume.hash_of(p).ok())
    }

    /// Resolve a child of this directory.
    pub async fn child(&self, name: &str) -> Result<PathInfo> {
        validate_name(name)?;
        Self::resolve(&self.volume, self.path().join(name)).await
    }
}

impl PartialEq for PathInfo {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for PathInfo {}

impl Hash for PathInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// Join `relative` onto `base`, normalizing `.` and `..` lexically.
///
/// Fails with `PermissionDenied` when the normalized result leaves `base`.
pub fn combine(base: &Path, relative: &str) -> Result<PathBuf> {
    let mut out = base.to_path_buf();
    let mut depth = 0usize;
    for part in relative.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return Err(ConnectorError::PermissionDenied);
                }
                out.pop();
                depth -= 1;
            }
            name => {
                if name.contains('\0') {
                    return Err(ConnectorError::InvalidName(name.to_string()));
                }
                out.push(name);
                depth += 1;
            }
        }
    }
    Ok(out)
}

/// Check that `name` is a single valid path component.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(ConnectorError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_volume() -> (TempDir, Arc<Volume>) {
        let temp_dir = TempDir::new().unwrap();
        let volume = Volume::new("v1_", temp_dir.path()).unwrap();
        (temp_dir, Arc::new(volume))
    }

    #[test]
    fn test_combine_normalizes() {
        let base = Path::new("/srv/root");
        assert_eq!(combine(base, "/a/./b").unwrap(), base.join("a").join("b"));
        assert_eq!(combine(base, "/a/../b").unwrap(), base.join("b"));
        assert_eq!(combine(base, "/").unwrap(), base.to_path_buf());
    }

    #[test]
    fn test_combine_rejects_traversal() {
        let base = Path::new("/srv/root");
        assert!(matches!(
            combine(base, "/../etc/passwd"),
            Err(ConnectorError::PermissionDenied)
        ));
        assert!(matches!(
            combine(base, "/a/../../b"),
            Err(ConnectorError::PermissionDenied)
        ));
        assert!(matches!(
            combine(base, "..\\..\\windows"),
            Err(ConnectorError::PermissionDenied)
        ));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("report.pdf").is_ok());
        assert!(validate_name("日本語.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("a\nb").is_err());
    }

    #[test]
    fn test_relative_path_and_hash() {
        let (_temp_dir, volume) = setup_volume();
        let root = volume.root().to_path_buf();

        assert_eq!(volume.relative_path(&root).unwrap(), "/");
        assert_eq!(
            volume.relative_path(&root.join("a").join("b.txt")).unwrap(),
            "/a/b.txt"
        );
        assert_eq!(volume.hash_of(&root).unwrap(), "v1_Lw");

        let hash = volume.hash_of(&root.join("a").join("b.txt")).unwrap();
        assert!(volume.owns_hash(&hash));
        assert_eq!(volume.decode_hash(&hash).unwrap(), root.join("a").join("b.txt"));
    }

    #[test]
    fn test_relative_path_outside_root() {
        let (_temp_dir, volume) = setup_volume();
        assert!(matches!(
            volume.relative_path(Path::new("/definitely/elsewhere")),
            Err(ConnectorError::PermissionDenied)
        ));
    }

    #[test]
    fn test_decode_hash_traversal_rejected() {
        let (_temp_dir, volume) = setup_volume();
        let token = PathCodec::new().encode("/../../etc");
        assert!(matches!(
            volume.decode_hash(&format!("v1_{token}")),
            Err(ConnectorError::PermissionDenied)
        ));
    }

    #[test]
    fn test_decode_hash_wrong_volume() {
        let (_temp_dir, volume) = setup_volume();
        assert!(matches!(
            volume.decode_hash("v2_Lw"),
            Err(ConnectorError::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_entry_stat() {
        let (_temp_dir, volume) = setup_volume();
        let file = volume.root().join("hello.txt");
        std::fs::write(&file, b"hello").unwrap();

        let entry = volume.entry(file).await.unwrap();
        assert!(entry.exists());
        assert!(!entry.is_dir());
        assert_eq!(entry.size(), 5);
        assert_eq!(entry.name(), "hello.txt");
        assert!(entry.modified().is_some());

        let missing = volume.entry(volume.root().join("nope")).await.unwrap();
        assert!(!missing.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_entry_symlink_escape_rejected() {
        let (_temp_dir, volume) = setup_volume();
        let outside = TempDir::new().unwrap();
        let link = volume.root().join("escape");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        assert!(matches!(
            volume.entry(link).await,
            Err(ConnectorError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_path_info_equality_by_hash() {
        let (_temp_dir, volume) = setup_volume();
        let a = PathInfo::resolve(&volume, volume.root().join("x")).await.unwrap();
        let b = PathInfo::resolve(&volume, volume.root().join("x")).await.unwrap();
        let root = PathInfo::resolve(&volume, volume.root().to_path_buf())
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, root);
        assert!(root.is_root());
        assert_eq!(root.parent_hash(), None);
        assert_eq!(a.parent_hash().as_deref(), Some(root.hash()));
        assert_eq!(root.name(), volume.name());
    }

    #[test]
    fn test_upload_filter() {
        let (_temp_dir, volume) = setup_volume();
        let volume = (*volume).clone().with_upload_filter(
            vec!["image/".to_string(), "text/plain".to_string()],
            vec!["image/gif".to_string()],
        );
        assert!(volume.upload_allowed("a.png"));
        assert!(volume.upload_allowed("a.txt"));
        assert!(!volume.upload_allowed("a.gif"));
        assert!(!volume.upload_allowed("a.exe"));
    }

    #[test]
    fn test_thumbnail_path_hidden() {
        let (_temp_dir, volume) = setup_volume();
        let thumb = volume.thumbnail_path(&volume.root().join("a.png")).unwrap();
        assert!(volume.is_hidden_path(&thumb));
        assert!(thumb.to_string_lossy().ends_with(".png"));
        assert!(!volume.is_hidden_path(&volume.root().join("a.png")));
    }

    #[test]
    fn test_relative_thumbnail_dir_under_root() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = VolumeConfig::new(temp_dir.path().to_string_lossy());
        config.thumbnail_dir = Some("thumbs".to_string());
        let volume = Volume::from_config(&config, 0).unwrap();
        assert_eq!(volume.thumbnail_dir(), volume.root().join("thumbs").as_path());
    }

    #[tokio::test]
    async fn test_ensure_within_missing_path() {
        let (_temp_dir, volume) = setup_volume();
        assert!(volume
            .ensure_within(&volume.root().join("a").join("b"))
            .await
            .is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ensure_within_rejects_symlink_escape() {
        let (_temp_dir, volume) = setup_volume();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), volume.root().join("link")).unwrap();

        let escaped = volume.root().join("link").join("evil");
        assert!(matches!(
            volume.ensure_within(&escaped).await,
            Err(ConnectorError::PermissionDenied)
        ));
        assert!(matches!(
            volume.entry(escaped).await,
            Err(ConnectorError::PermissionDenied)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ensure_within_rejects_dangling_symlink() {
        let (_temp_dir, volume) = setup_volume();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("gone"), volume.root().join("link")).unwrap();

        assert!(matches!(
            volume.ensure_within(&volume.root().join("link").join("x")).await,
            Err(ConnectorError::PermissionDenied)
        ));
    }
}
