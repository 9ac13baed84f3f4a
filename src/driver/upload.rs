//! Single and chunked uploads.
//!
//! A chunked upload is three kinds of request:
//!
//! 1. each part is stored under the temp directory inside the
//!    `chunk_transfer` hooks;
//! 2. the request that completes the set assembles the parts into one staged
//!    file and answers with its key;
//! 3. the commit request moves the staged file into the volume inside the
//!    `chunk_merge` hooks.
//!
//! Only step 3 changes bytes under a volume root. Any failure removes the
//! session's leftovers inside the `chunk_rollback` hooks.

use std::io;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::hooks::{Delta, HookTarget, MutationEvent, MutationKind};
use super::ops::{move_path, place, remove_path, Batch, ConflictPolicy};
use super::temp::MERGED_PREFIX;
use super::{require_dir, FileSystemDriver};
use crate::connector::response::ConnectorResponse;
use crate::volume::attribute::can_create;
use crate::volume::{combine, validate_name, PathInfo, Volume};
use crate::{ConnectorError, Result};

/// One uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// File name without any client-side directory prefix.
    fn base_name(&self) -> &str {
        self.name.rsplit(['/', '\\']).next().unwrap_or(&self.name)
    }
}

/// An `upload` command without chunking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub files: Vec<UploadFile>,
    /// Per-file sub-directory under the target (`upload_path[]`).
    pub paths: Vec<String>,
    pub policy: ConflictPolicy,
}

/// One part of a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpload {
    /// Client id of the upload session.
    pub cid: String,
    /// Name of the whole file.
    pub name: String,
    pub index: usize,
    /// Index of the last part.
    pub last: usize,
    /// Declared `(start, length, total)` byte range.
    pub range: Option<(u64, u64, u64)>,
    pub content: Vec<u8>,
}

impl ChunkUpload {
    /// Build a part from the `chunk`, `cid` and `range` parameters.
    ///
    /// `chunk` has the form `name.N_M.part`: part `N` of parts `0..=M`.
    pub fn parse(chunk: &str, cid: &str, range: Option<&str>, content: Vec<u8>) -> Result<Self> {
        let invalid = || ConnectorError::CommandParams("upload".to_string());
        let (name, index, last) = parse_chunk_name(chunk).ok_or_else(invalid)?;
        let range = match range {
            Some(range) => Some(parse_range(range).ok_or_else(invalid)?),
            None => None,
        };
        Ok(Self {
            cid: cid.to_string(),
            name,
            index,
            last,
            range,
            content,
        })
    }

    /// Declared size of the whole file.
    pub fn total(&self) -> u64 {
        self.range
            .map(|(_, _, total)| total)
            .unwrap_or(self.content.len() as u64)
    }
}

/// Whether a `chunk` parameter names a part rather than a merged session.
pub fn is_chunk_part(chunk: &str) -> bool {
    parse_chunk_name(chunk).is_some()
}

fn parse_chunk_name(chunk: &str) -> Option<(String, usize, usize)> {
    let rest = chunk.strip_suffix(".part")?;
    let (name, counts) = rest.rsplit_once('.')?;
    let (index, last) = counts.split_once('_')?;
    let index: usize = index.parse().ok()?;
    let last: usize = last.parse().ok()?;
    if name.is_empty() || index > last {
        return None;
    }
    Some((name.to_string(), index, last))
}

fn parse_range(range: &str) -> Option<(u64, u64, u64)> {
    let mut parts = range.split(',').map(|p| p.trim().parse::<u64>().ok());
    let start = parts.next()??;
    let length = parts.next()??;
    let total = parts.next()??;
    if parts.next().is_some() || start.checked_add(length)? > total {
        return None;
    }
    Some((start, length, total))
}

fn check_upload(volume: &Volume, name: &str, size: u64) -> Result<()> {
    if volume.max_upload_size().is_some_and(|max| size > max) {
        return Err(ConnectorError::UploadFileSize);
    }
    if !volume.upload_allowed(name) {
        return Err(ConnectorError::FileTypeNotAllow);
    }
    Ok(())
}

fn require_create(dir: &PathInfo) -> Result<()> {
    require_dir(dir)?;
    if !can_create(dir.attribute()) {
        return Err(ConnectorError::PermissionDenied);
    }
    Ok(())
}

impl FileSystemDriver {
    pub(super) async fn upload_files(
        &self,
        target: &PathInfo,
        request: UploadRequest,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        require_create(target)?;
        if request.files.is_empty() {
            return Err(ConnectorError::CommandParams("upload".to_string()));
        }

        let mut response = ConnectorResponse::default();
        let mut added = Vec::new();
        let mut batch = Batch::default();
        for (index, file) in request.files.into_iter().enumerate() {
            if token.is_cancelled() {
                return Err(ConnectorError::ConnectionAborted);
            }
            let subdir = request.paths.get(index).filter(|p| !p.is_empty());
            let result = match subdir {
                Some(relative) => match self.upload_dir(target, relative).await {
                    Ok(dir) => self.upload_one(&dir, file, &request.policy, token).await,
                    Err(e) => Err(e),
                },
                None => self.upload_one(target, file, &request.policy, token).await,
            };
            if let Some(uploaded) = batch.record(result)? {
                added.push(self.describe(&uploaded).await);
            }
        }

        batch.finish(&mut response)?;
        response.added = Some(added);
        Ok(response)
    }

    async fn upload_dir(&self, target: &PathInfo, relative: &str) -> Result<PathInfo> {
        for part in relative.split(['/', '\\']).filter(|p| !p.is_empty()) {
            validate_name(part)?;
        }
        let path = combine(target.path(), relative)?;
        target.volume().ensure_within(&path).await?;
        tokio::fs::create_dir_all(&path).await?;
        let dir = PathInfo::resolve(target.volume(), path).await?;
        require_create(&dir)?;
        Ok(dir)
    }

    async fn upload_one(
        &self,
        dir: &PathInfo,
        file: UploadFile,
        policy: &ConflictPolicy,
        token: &CancellationToken,
    ) -> Result<PathInfo> {
        let name = file.base_name().to_string();
        validate_name(&name)?;
        let size = file.content.len() as u64;
        let volume = dir.volume();
        check_upload(volume, &name, size)?;

        let placement = place(dir, &name, policy, volume.upload_overwrite(), token).await?;
        let replaces = placement.replaces();
        let overwritten = placement.overwritten;
        let dest = placement.dest.path().to_path_buf();
        let mut event = MutationEvent::new(
            MutationKind::Upload,
            HookTarget::new(volume, dest.clone(), false),
        )
        .with_incoming(size);
        if replaces {
            event = event.with_overwritten(overwritten);
        }

        let content = file.content;
        self.hooks
            .upload
            .run(event, |_| async move {
                if replaces {
                    remove_path(&dest).await?;
                }
                tokio::fs::write(&dest, content).await?;
                Ok(((), Delta::target(size as i64 - overwritten as i64)))
            })
            .await?;

        debug!(volume = volume.id(), name = %name, size, "Uploaded file");
        PathInfo::resolve(volume, placement.dest.path().to_path_buf()).await
    }

    pub(super) async fn store_chunk(
        &self,
        target: &PathInfo,
        chunk: ChunkUpload,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        require_create(target)?;
        validate_name(&chunk.name)?;
        let volume = target.volume();
        check_upload(volume, &chunk.name, chunk.total())?;
        let session = self.temp.chunk_dir(&chunk.cid)?;

        let dest = target.child(&chunk.name).await?;
        let overwritten = if dest.exists() && volume.upload_overwrite() {
            dest.entry().size()
        } else {
            0
        };
        let mut event = MutationEvent::new(
            MutationKind::ChunkTransfer,
            HookTarget::new(volume, dest.path().to_path_buf(), false),
        )
        .with_incoming(chunk.total());
        if overwritten > 0 {
            event = event.with_overwritten(overwritten);
        }

        let part = session.join(chunk.index.to_string());
        let part_dir = session.clone();
        let content = chunk.content;
        let stored = self
            .hooks
            .chunk_transfer
            .run(event, |_| async move {
                tokio::fs::create_dir_all(&part_dir).await?;
                tokio::fs::write(&part, content).await?;
                Ok(((), Delta::NONE))
            })
            .await;
        if let Err(e) = stored {
            self.rollback_chunks(target, &chunk.name, vec![session]).await;
            return Err(e);
        }

        let complete = (0..=chunk.last).all(|i| session.join(i.to_string()).is_file());
        if !complete {
            return Ok(ConnectorResponse {
                added: Some(Vec::new()),
                ..Default::default()
            });
        }

        let (key, merged) = self.temp.stage(MERGED_PREFIX, "part");
        let assembled = assemble(session.clone(), merged.clone(), chunk.last, token.clone()).await;
        if let Err(e) = assembled {
            self.rollback_chunks(target, &chunk.name, vec![session, merged])
                .await;
            return Err(e);
        }
        self.temp.remove(&session).await;
        debug!(cid = %chunk.cid, key = %key, parts = chunk.last + 1, "Chunks assembled");

        Ok(ConnectorResponse {
            added: Some(Vec::new()),
            chunk_merged: Some(key),
            chunk_name: Some(chunk.name),
            ..Default::default()
        })
    }

    pub(super) async fn merge_chunks(
        &self,
        target: &PathInfo,
        key: &str,
        name: &str,
        policy: &ConflictPolicy,
    ) -> Result<ConnectorResponse> {
        require_create(target)?;
        validate_name(name)?;
        let staged = self.temp.staged(MERGED_PREFIX, key, "part")?;

        let committed = self.commit_staged(target, &staged, name, policy).await;
        let info = match committed {
            Ok(info) => info,
            Err(e) => {
                self.rollback_chunks(target, name, vec![staged]).await;
                return Err(e);
            }
        };
        Ok(ConnectorResponse {
            added: Some(vec![self.describe(&info).await]),
            ..Default::default()
        })
    }

    async fn commit_staged(
        &self,
        target: &PathInfo,
        staged: &std::path::Path,
        name: &str,
        policy: &ConflictPolicy,
    ) -> Result<PathInfo> {
        let volume = target.volume();
        let size = tokio::fs::metadata(staged).await?.len();
        check_upload(volume, name, size)?;

        let token = CancellationToken::new();
        let placement = place(target, name, policy, volume.upload_overwrite(), &token).await?;
        let replaces = placement.replaces();
        let overwritten = placement.overwritten;
        let dest = placement.dest.path().to_path_buf();
        let mut event = MutationEvent::new(
            MutationKind::ChunkMerge,
            HookTarget::new(volume, dest.clone(), false),
        )
        .with_incoming(size);
        if replaces {
            event = event.with_overwritten(overwritten);
        }

        let staged = staged.to_path_buf();
        self.hooks
            .chunk_merge
            .run(event, |_| async move {
                if replaces {
                    remove_path(&dest).await?;
                }
                move_path(&staged, &dest, &token).await?;
                Ok(((), Delta::target(size as i64 - overwritten as i64)))
            })
            .await?;

        PathInfo::resolve(volume, placement.dest.path().to_path_buf()).await
    }

    /// Remove chunk leftovers inside the rollback hooks. Failures are logged.
    async fn rollback_chunks(&self, target: &PathInfo, name: &str, leftovers: Vec<PathBuf>) {
        let event = MutationEvent::new(
            MutationKind::ChunkRollback,
            HookTarget::new(target.volume(), target.path().join(name), false),
        );
        let result = self
            .hooks
            .chunk_rollback
            .run(event, |_| async move {
                for path in &leftovers {
                    remove_path(path).await?;
                }
                Ok(((), Delta::NONE))
            })
            .await;
        if let Err(e) = result {
            warn!(name, error = %e, "Chunk rollback failed");
        }
    }
}

/// Concatenate parts `0..=last` of a session into `merged`.
async fn assemble(
    session: PathBuf,
    merged: PathBuf,
    last: usize,
    token: CancellationToken,
) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut out = io::BufWriter::new(std::fs::File::create(&merged)?);
        for index in 0..=last {
            if token.is_cancelled() {
                return Err(ConnectorError::ConnectionAborted);
            }
            let mut part = std::fs::File::open(session.join(index.to_string()))?;
            io::copy(&mut part, &mut out)?;
        }
        io::Write::flush(&mut out)?;
        Ok(())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::{fixture, fixture_with};
    use crate::driver::Driver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    fn request(files: Vec<UploadFile>) -> UploadRequest {
        UploadRequest {
            files,
            ..Default::default()
        }
    }

    fn part(cid: &str, name: &str, index: usize, last: usize, content: &[u8]) -> ChunkUpload {
        ChunkUpload {
            cid: cid.to_string(),
            name: name.to_string(),
            index,
            last,
            range: None,
            content: content.to_vec(),
        }
    }

    #[test]
    fn test_parse_chunk() {
        let chunk = ChunkUpload::parse("photo.jpg.2_4.part", "c1", Some("200,100,500"), vec![1])
            .unwrap();
        assert_eq!(chunk.name, "photo.jpg");
        assert_eq!((chunk.index, chunk.last), (2, 4));
        assert_eq!(chunk.range, Some((200, 100, 500)));
        assert_eq!(chunk.total(), 500);

        assert!(is_chunk_part("a.1_1.part"));
        assert!(!is_chunk_part("merged-abc"));
        assert!(ChunkUpload::parse("a.3_1.part", "c1", None, vec![]).is_err());
        assert!(ChunkUpload::parse("a.0_1.part", "c1", Some("5,10,8"), vec![]).is_err());
        assert!(ChunkUpload::parse("a.0_1.part", "c1", Some("x,1,2"), vec![]).is_err());
    }

    #[tokio::test]
    async fn test_upload_files() {
        let fx = fixture();
        let response = fx
            .driver
            .upload(
                &fx.root().await,
                request(vec![
                    UploadFile::new("a.txt", "hello"),
                    UploadFile::new("C:\\fakepath\\b.txt", "bye"),
                ]),
                &token(),
            )
            .await
            .unwrap();
        let names: Vec<String> = response.added.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(std::fs::read(fx.volume.root().join("a.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_upload_no_overwrite_renames() {
        let fx = fixture();
        std::fs::write(fx.volume.root().join("a.txt"), b"old").unwrap();
        let mut req = request(vec![UploadFile::new("a.txt", "new")]);
        req.policy.overwrite = Some(false);
        let response = fx
            .driver
            .upload(&fx.root().await, req, &token())
            .await
            .unwrap();
        assert_eq!(response.added.unwrap()[0].name, "a~1.txt");
        assert_eq!(std::fs::read(fx.volume.root().join("a.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_upload_paths_create_subdirs() {
        let fx = fixture();
        let req = UploadRequest {
            files: vec![UploadFile::new("a.txt", "x"), UploadFile::new("b.txt", "y")],
            paths: vec!["/photos/2024".to_string(), String::new()],
            policy: ConflictPolicy::default(),
        };
        fx.driver.upload(&fx.root().await, req, &token()).await.unwrap();
        assert!(fx.volume.root().join("photos/2024/a.txt").is_file());
        assert!(fx.volume.root().join("b.txt").is_file());
    }

    #[tokio::test]
    async fn test_upload_limits() {
        let fx = fixture_with(|volume| {
            volume
                .with_max_upload_size(4)
                .with_upload_filter(Vec::new(), vec!["application/x-msdownload".to_string()])
        });
        let root = fx.root().await;

        let big = fx
            .driver
            .upload(&root, request(vec![UploadFile::new("big.txt", "12345")]), &token())
            .await;
        assert!(matches!(big, Err(ConnectorError::UploadFileSize)));

        let denied = fx
            .driver
            .upload(&root, request(vec![UploadFile::new("x.exe", "1")]), &token())
            .await;
        assert!(matches!(denied, Err(ConnectorError::FileTypeNotAllow)));

        // One good file turns the other failure into a warning.
        let mixed = fx
            .driver
            .upload(
                &root,
                request(vec![
                    UploadFile::new("ok.txt", "1"),
                    UploadFile::new("big.txt", "12345"),
                ]),
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(mixed.added.unwrap().len(), 1);
        assert_eq!(mixed.warning.unwrap(), vec!["errUploadFileSize".to_string()]);
    }

    #[tokio::test]
    async fn test_chunked_upload() {
        let fx = fixture();
        let root = fx.root().await;

        let first = fx
            .driver
            .upload_chunk(&root, part("cid1", "big.bin", 1, 2, b"BBB"), &token())
            .await
            .unwrap();
        assert!(first.chunk_merged.is_none());
        fx.driver
            .upload_chunk(&root, part("cid1", "big.bin", 0, 2, b"AAA"), &token())
            .await
            .unwrap();
        let last = fx
            .driver
            .upload_chunk(&root, part("cid1", "big.bin", 2, 2, b"CC"), &token())
            .await
            .unwrap();
        let key = last.chunk_merged.unwrap();
        assert_eq!(last.chunk_name.as_deref(), Some("big.bin"));
        // Nothing lands in the volume before the commit.
        assert!(!fx.volume.root().join("big.bin").exists());

        let committed = fx
            .driver
            .commit_chunk(&root, &key, "big.bin", &ConflictPolicy::default())
            .await
            .unwrap();
        assert_eq!(committed.added.unwrap()[0].size, 8);
        assert_eq!(
            std::fs::read(fx.volume.root().join("big.bin")).unwrap(),
            b"AAABBBCC"
        );

        // The staged file is gone after commit.
        let again = fx
            .driver
            .commit_chunk(&root, &key, "big.bin", &ConflictPolicy::default())
            .await;
        assert!(matches!(again, Err(ConnectorError::FileNotFound)));
    }

    #[tokio::test]
    async fn test_chunk_veto_rolls_back() {
        let fx = fixture();
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rollbacks);
        fx.driver.hooks().chunk_rollback.on_after(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        fx.driver.hooks().chunk_transfer.on_before(|event| async move {
            if event.target.path.ends_with("blocked.bin") {
                return Err(ConnectorError::Quota {
                    maximum: 10,
                    usage: 0,
                });
            }
            Ok(())
        });

        let root = fx.root().await;
        fx.driver
            .upload_chunk(&root, part("cid2", "ok.bin", 0, 1, b"x"), &token())
            .await
            .unwrap();
        let session = fx.driver.temp().chunk_dir("cid2").unwrap();
        assert!(session.join("0").is_file());

        let vetoed = fx
            .driver
            .upload_chunk(&root, part("cid3", "blocked.bin", 0, 1, b"x"), &token())
            .await;
        assert!(matches!(vetoed, Err(ConnectorError::Quota { .. })));
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert!(!fx.driver.temp().chunk_dir("cid3").unwrap().exists());
    }
}
