//! Response envelope and entry descriptors.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::volume::PathInfo;
use crate::ConnectorError;

/// Protocol version reported by `open` with `init`.
pub const API_VERSION: &str = "2.1";

fn is_false(value: &bool) -> bool {
    !*value
}

mod flag {
    use serde::Serializer;

    /// Booleans go over the wire as 0/1.
    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }
}

/// Descriptor of one file or directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub name: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phash: Option<String>,
    pub mime: String,
    pub ts: i64,
    pub size: u64,
    #[serde(with = "flag")]
    pub read: bool,
    #[serde(with = "flag")]
    pub write: bool,
    #[serde(with = "flag")]
    pub locked: bool,
    #[serde(with = "flag", skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(with = "flag", skip_serializing_if = "is_false")]
    pub dirs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumeid: Option<String>,
    #[serde(with = "flag", skip_serializing_if = "is_false")]
    pub isroot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl FileDescriptor {
    /// Build a descriptor for a resolved entry.
    pub fn from_info(info: &PathInfo) -> Self {
        let entry = info.entry();
        let attribute = info.attribute();
        let volume = info.volume();
        let is_root = info.is_root();

        let mime = if entry.is_dir() {
            "directory".to_string()
        } else {
            mime_guess::from_path(entry.path())
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        };

        let url = match volume.url() {
            Some(base) if !entry.is_dir() && attribute.read() && !attribute.show_only() => {
                let encoded: Vec<String> = info
                    .relative()
                    .split(volume.separator())
                    .filter(|p| !p.is_empty())
                    .map(|p| urlencoding::encode(p).into_owned())
                    .collect();
                Some(format!("{}/{}", base.trim_end_matches('/'), encoded.join("/")))
            }
            _ => None,
        };

        Self {
            name: info.name(),
            hash: info.hash().to_string(),
            phash: info.parent_hash(),
            mime,
            ts: entry.modified().map(|t| t.timestamp()).unwrap_or_default(),
            size: entry.size(),
            read: attribute.read(),
            write: attribute.write(),
            locked: attribute.locked(),
            hidden: !attribute.visible(),
            dirs: false,
            volumeid: is_root.then(|| volume.id().to_string()),
            isroot: is_root,
            tmb: None,
            url,
        }
    }

    pub fn with_dirs(mut self, dirs: bool) -> Self {
        self.dirs = dirs;
        self
    }

    pub fn with_tmb(mut self, tmb: Option<String>) -> Self {
        self.tmb = tmb;
        self
    }
}

/// Archive MIME types usable with `archive` and `extract`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiverOptions {
    pub create: Vec<String>,
    pub extract: Vec<String>,
}

/// Per-directory capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeOptions {
    /// Display path (`Volume name/dir/sub`).
    pub path: String,
    pub url: String,
    pub tmb_url: String,
    pub separator: String,
    pub disabled: Vec<String>,
    #[serde(with = "flag")]
    pub copy_overwrite: bool,
    #[serde(with = "flag")]
    pub upload_overwrite: bool,
    /// Maximum upload size in bytes, 0 when unlimited.
    pub upload_max_size: u64,
    pub archivers: ArchiverOptions,
}

/// `zipdl` phase one result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZipDownload {
    /// Download key.
    pub file: String,
    /// Suggested file name.
    pub name: String,
    pub mime: String,
}

/// Successful command response. Unset fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<FileDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<VolumeOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<Vec<FileDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<Vec<FileDescriptor>>,
    /// `ls`: hash to name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<Vec<FileDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_cnt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_cnt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizes: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dim: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// `tmb`: hash to thumbnail name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zipdl: Option<ZipDownload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<Vec<String>>,
    /// `mkdir` with `dirs[]`: requested path to hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<BTreeMap<String, String>>,
    #[serde(rename = "_chunkmerged", skip_serializing_if = "Option::is_none")]
    pub chunk_merged: Option<String>,
    #[serde(rename = "_name", skip_serializing_if = "Option::is_none")]
    pub chunk_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upl_max_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_drivers: Option<Vec<String>>,
}

impl ConnectorResponse {
    /// Append warnings, creating the list on first use.
    pub fn push_warning(&mut self, code: &str, details: impl IntoIterator<Item = String>) {
        let warnings = self.warning.get_or_insert_with(Vec::new);
        warnings.push(code.to_string());
        warnings.extend(details);
    }
}

/// A file to stream back instead of JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    pub path: PathBuf,
    /// Name offered to the client.
    pub name: String,
    pub mime: String,
    /// Serve as an attachment rather than inline.
    pub attachment: bool,
    /// Remove the file once it has been opened for streaming.
    pub delete_after: bool,
}

/// Error payload: `{"error": [code, details...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    pub status: u16,
    pub error: Vec<String>,
}

impl From<&ConnectorError> for ErrorResponse {
    fn from(error: &ConnectorError) -> Self {
        let mut payload = vec![error.code().to_string()];
        payload.extend(error.details());
        Self {
            status: error.status(),
            error: payload,
        }
    }
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorResult {
    Success(Box<ConnectorResponse>),
    File(FileResult),
    Error(ErrorResponse),
}

impl ConnectorResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, ConnectorResult::Error(_))
    }

    /// The JSON response, if this is one.
    pub fn response(&self) -> Option<&ConnectorResponse> {
        match self {
            ConnectorResult::Success(response) => Some(response.as_ref()),
            _ => None,
        }
    }

    /// The error payload, if this is one.
    pub fn error(&self) -> Option<&ErrorResponse> {
        match self {
            ConnectorResult::Error(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ConnectorResponse> for ConnectorResult {
    fn from(response: ConnectorResponse) -> Self {
        ConnectorResult::Success(Box::new(response))
    }
}

impl From<ConnectorError> for ConnectorResult {
    fn from(error: ConnectorError) -> Self {
        ConnectorResult::Error(ErrorResponse::from(&error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_error_payload() {
        let result = ConnectorResult::from(ConnectorError::Quota {
            maximum: 1000,
            usage: 400,
        });
        let error = result.error().unwrap();
        assert_eq!(error.status, 403);
        let json = serde_json::to_value(error).unwrap();
        assert_eq!(json, serde_json::json!({"error": ["errQuota", "1000", "400"]}));
    }

    #[test]
    fn test_response_omits_unset_fields() {
        let response = ConnectorResponse {
            removed: Some(vec!["v1_abc".to_string()]),
            chunk_merged: Some("merged-1".to_string()),
            file_cnt: Some(2),
            ..Default::default()
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"removed": ["v1_abc"], "_chunkmerged": "merged-1", "fileCnt": 2})
        );
    }

    #[test]
    fn test_push_warning() {
        let mut response = ConnectorResponse::default();
        response.push_warning("errExists", vec!["a.txt".to_string()]);
        response.push_warning("errUploadMime", Vec::new());
        assert_eq!(
            response.warning.unwrap(),
            vec!["errExists", "a.txt", "errUploadMime"]
        );
    }

    #[tokio::test]
    async fn test_descriptor_from_info() {
        let temp_dir = TempDir::new().unwrap();
        let volume = Arc::new(
            Volume::new("v1_", temp_dir.path())
                .unwrap()
                .with_name("Home")
                .with_url("https://files.example/home/"),
        );
        std::fs::write(volume.root().join("a b.txt"), b"hello").unwrap();

        let root = PathInfo::resolve(&volume, volume.root().to_path_buf())
            .await
            .unwrap();
        let root_desc = FileDescriptor::from_info(&root).with_dirs(true);
        assert_eq!(root_desc.name, "Home");
        assert_eq!(root_desc.mime, "directory");
        assert_eq!(root_desc.volumeid.as_deref(), Some("v1_"));
        assert!(root_desc.isroot);
        assert_eq!(root_desc.phash, None);
        assert_eq!(root_desc.url, None);

        let file = PathInfo::resolve(&volume, volume.root().join("a b.txt"))
            .await
            .unwrap();
        let desc = FileDescriptor::from_info(&file);
        assert_eq!(desc.mime, "text/plain");
        assert_eq!(desc.size, 5);
        assert_eq!(desc.phash.as_deref(), Some(root.hash()));
        assert_eq!(
            desc.url.as_deref(),
            Some("https://files.example/home/a%20b.txt")
        );

        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["read"], 1);
        assert_eq!(json["locked"], 0);
        assert!(json.get("isroot").is_none());
        assert!(json.get("hidden").is_none());
    }
}
