//! Command dispatch.
//!
//! [`Connector::process`] validates a [`ConnectorCommand`], resolves its hash
//! parameters to targets, registers it for cancellation and hands it to the
//! [`Driver`]. Failures never escape: they come back as
//! [`ConnectorResult::Error`].

pub mod command;
pub mod manager;
pub mod response;

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::driver::picture::DEFAULT_QUALITY;
use crate::driver::{
    is_chunk_part, ChunkUpload, ConflictPolicy, Driver, ResizeMode, ResizeRequest, UploadFile,
    UploadRequest,
};
use crate::volume::PathInfo;
use crate::{ConnectorError, Result};

use self::command::Command;
use self::manager::ConnectorManager;
use self::response::{ConnectorResponse, ConnectorResult, FileResult, API_VERSION};

/// One decoded request.
///
/// Array parameters keep their wire names, e.g. `targets[]`.
#[derive(Debug, Clone, Default)]
pub struct ConnectorCommand {
    pub cmd: Option<String>,
    pub args: HashMap<String, Vec<String>>,
    pub files: Vec<UploadFile>,
    /// Client request id (`reqid`), used by `abort`.
    pub request_id: Option<String>,
}

impl ConnectorCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: Some(cmd.into()),
            ..Default::default()
        }
    }

    /// Append a value to a parameter.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_arg(key, value);
        self
    }

    pub fn with_file(mut self, file: UploadFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn push_arg(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.args.entry(key.into()).or_default().push(value.into());
    }

    /// First value of a parameter.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of a parameter.
    pub fn values(&self, key: &str) -> &[String] {
        self.args.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A `0`/`1` parameter.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.arg(key), Some("1") | Some("true"))
    }

    fn has(&self, key: &str) -> bool {
        self.values(key).iter().any(|v| !v.is_empty())
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.arg(key).filter(|v| !v.is_empty())
    }

    fn number<T: FromStr>(&self, key: &str, command: Command) -> Result<T> {
        self.arg(key)
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ConnectorError::CommandParams(command.to_string()))
    }

    fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy {
            renames: self.values("renames[]").to_vec(),
            suffix: self.arg("suffix").unwrap_or_default().to_string(),
            overwrite: self.arg("overwrite").map(|v| v != "0"),
        }
    }
}

/// Drop targets that sit inside another targeted directory.
///
/// Removing the directory removes them already; duplicates go too.
pub fn without_nested(targets: Vec<PathInfo>) -> Vec<PathInfo> {
    let dirs: Vec<_> = targets
        .iter()
        .filter(|t| t.is_directory())
        .map(|t| t.path().to_path_buf())
        .collect();
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|t| {
            !dirs
                .iter()
                .any(|dir| t.path() != dir.as_path() && t.path().starts_with(dir))
        })
        .filter(|t| seen.insert(t.hash().to_string()))
        .collect()
}

/// Entry point for every protocol command.
pub struct Connector {
    driver: Arc<dyn Driver>,
    manager: Arc<ConnectorManager>,
    disabled: HashSet<Command>,
}

impl Connector {
    pub fn new(driver: Arc<dyn Driver>, manager: Arc<ConnectorManager>) -> Self {
        Self {
            driver,
            manager,
            disabled: HashSet::new(),
        }
    }

    /// Reject the named commands with `errCmdNoSupport`.
    pub fn with_disabled(mut self, names: &[String]) -> Self {
        for name in names {
            match name.parse::<Command>() {
                Ok(Command::Open) => warn!("The open command cannot be disabled"),
                Ok(command) => {
                    self.disabled.insert(command);
                }
                Err(_) => warn!(command = %name, "Ignoring unknown disabled command"),
            }
        }
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn manager(&self) -> &Arc<ConnectorManager> {
        &self.manager
    }

    /// Run one command.
    pub async fn process(&self, command: ConnectorCommand) -> ConnectorResult {
        let name = command.cmd.clone().unwrap_or_default();
        match self.dispatch(command).await {
            Ok(result) => result,
            Err(e) => {
                if e.status() >= 500 {
                    error!(cmd = %name, error = %e, "Command failed");
                } else {
                    debug!(cmd = %name, error = %e, "Command rejected");
                }
                ConnectorResult::from(e)
            }
        }
    }

    /// Serve the thumbnail of a file, rendering it if needed.
    pub async fn thumbnail(&self, hash: &str) -> Result<Option<FileResult>> {
        let target = self.driver.resolve(hash).await?;
        self.driver.thumbnail(&target).await
    }

    async fn dispatch(&self, command: ConnectorCommand) -> Result<ConnectorResult> {
        let name = command
            .cmd
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(ConnectorError::CommandRequired)?;
        let cmd: Command = name.parse()?;
        if self.disabled.contains(&cmd) {
            return Err(ConnectorError::CommandNoSupport);
        }
        if cmd.required().iter().any(|param| !command.has(param)) {
            return Err(ConnectorError::CommandParams(cmd.to_string()));
        }

        if cmd == Command::Abort {
            let id = command.arg("id").unwrap_or_default();
            let found = self.manager.abort(id);
            debug!(request_id = id, found, "Abort requested");
            return Ok(ConnectorResponse::default().into());
        }

        let registration = command
            .request_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| self.manager.register(id));
        let token = registration
            .as_ref()
            .map(|r| r.token().clone())
            .unwrap_or_default();

        debug!(cmd = %cmd, request_id = ?command.request_id, "Dispatching command");
        let result = self.execute(cmd, command, &token).await;
        drop(registration);
        result
    }

    async fn execute(
        &self,
        cmd: Command,
        command: ConnectorCommand,
        token: &CancellationToken,
    ) -> Result<ConnectorResult> {
        let driver = self.driver.as_ref();
        let response = match cmd {
            Command::Open => self.open(&command).await?,
            Command::Ls => {
                let target = self.target(&command).await?;
                driver.ls(&target, command.values("intersect[]")).await?
            }
            Command::Tree => driver.tree(&self.target(&command).await?).await?,
            Command::Parents => {
                let target = self.target(&command).await?;
                let until = match command.non_empty("until") {
                    Some(hash) => Some(driver.resolve(hash).await?),
                    None => None,
                };
                driver.parents(&target, until.as_ref()).await?
            }
            Command::Info => driver.info(&self.targets(&command, cmd).await?).await?,
            Command::Mkdir => {
                let target = self.target(&command).await?;
                let name = command.non_empty("name");
                let dirs = command.values("dirs[]");
                if name.is_none() && dirs.is_empty() {
                    return Err(ConnectorError::CommandParams(cmd.to_string()));
                }
                driver.mkdir(&target, name, dirs).await?
            }
            Command::Mkfile => {
                let target = self.target(&command).await?;
                driver
                    .mkfile(&target, command.arg("name").unwrap_or_default())
                    .await?
            }
            Command::Rename => {
                let target = self.target(&command).await?;
                driver
                    .rename(&target, command.arg("name").unwrap_or_default())
                    .await?
            }
            Command::Rm => {
                let targets = without_nested(self.targets(&command, cmd).await?);
                driver.rm(&targets, token).await?
            }
            Command::Paste => {
                let dst = self.resolve_param(&command, "dst").await?;
                let targets = self.targets(&command, cmd).await?;
                driver
                    .paste(
                        &dst,
                        &targets,
                        command.flag("cut"),
                        &command.conflict_policy(),
                        token,
                    )
                    .await?
            }
            Command::Duplicate => {
                driver
                    .duplicate(&self.targets(&command, cmd).await?, token)
                    .await?
            }
            Command::Get => driver.get(&self.target(&command).await?).await?,
            Command::Put => {
                let target = self.target(&command).await?;
                driver
                    .put(&target, command.arg("content").unwrap_or_default())
                    .await?
            }
            Command::Upload => self.upload(command, token).await?,
            Command::Size => driver.size(&self.targets(&command, cmd).await?, token).await?,
            Command::Dim => driver.dim(&self.target(&command).await?).await?,
            Command::Resize => {
                let target = self.target(&command).await?;
                driver.resize(&target, resize_request(&command)?).await?
            }
            Command::Archive => {
                let targets = self.targets(&command, cmd).await?;
                let dst = match command.non_empty("target") {
                    Some(hash) => Some(driver.resolve(hash).await?),
                    None => None,
                };
                driver
                    .archive(
                        &targets,
                        dst.as_ref(),
                        command.arg("type").unwrap_or_default(),
                        command.non_empty("name"),
                        token,
                    )
                    .await?
            }
            Command::Extract => {
                let target = self.target(&command).await?;
                driver
                    .extract(&target, command.flag("makedir"), token)
                    .await?
            }
            Command::Search => self.search(&command, token).await?,
            Command::Tmb => driver.tmb(&self.targets(&command, cmd).await?).await?,
            Command::Zipdl => return self.zipdl(&command, token).await,
            Command::File => {
                let target = self.target(&command).await?;
                let file = driver.file(&target, command.flag("download")).await?;
                return Ok(ConnectorResult::File(file));
            }
            Command::Abort => ConnectorResponse::default(),
        };
        Ok(response.into())
    }

    async fn resolve_param(&self, command: &ConnectorCommand, key: &str) -> Result<PathInfo> {
        let hash = command
            .non_empty(key)
            .ok_or_else(|| ConnectorError::CommandParams(key.to_string()))?;
        self.driver.resolve(hash).await
    }

    async fn target(&self, command: &ConnectorCommand) -> Result<PathInfo> {
        self.resolve_param(command, "target").await
    }

    /// Resolve `targets[]`. All of them must live on one volume.
    async fn targets(&self, command: &ConnectorCommand, cmd: Command) -> Result<Vec<PathInfo>> {
        let mut targets = Vec::new();
        for hash in command.values("targets[]").iter().filter(|h| !h.is_empty()) {
            targets.push(self.driver.resolve(hash).await?);
        }
        let Some(first) = targets.first() else {
            return Err(ConnectorError::CommandParams(cmd.to_string()));
        };
        let volume = first.volume().id().to_string();
        if targets.iter().any(|t| t.volume().id() != volume) {
            return Err(ConnectorError::CommandParams(cmd.to_string()));
        }
        Ok(targets)
    }

    async fn default_root(&self) -> Result<PathInfo> {
        let volume = self
            .driver
            .volumes()
            .first()
            .ok_or(ConnectorError::FolderNotFound)?;
        PathInfo::resolve(volume, volume.root().to_path_buf()).await
    }

    async fn open(&self, command: &ConnectorCommand) -> Result<ConnectorResponse> {
        let init = command.flag("init");
        let tree = command.flag("tree");

        let target = match (command.non_empty("target"), init) {
            (Some(hash), false) => self.driver.resolve(hash).await?,
            (Some(hash), true) => match self.driver.resolve(hash).await {
                Ok(target) if target.exists() && target.is_directory() => target,
                _ => self.default_root().await?,
            },
            (None, true) => self.default_root().await?,
            (None, false) => return Err(ConnectorError::CommandParams(Command::Open.to_string())),
        };

        let mut response = self.driver.open(&target, tree).await?;
        if tree {
            // Other volumes show up as sibling roots.
            let files = response.files.get_or_insert_with(Vec::new);
            for volume in self.driver.volumes() {
                if volume.id() == target.volume().id() {
                    continue;
                }
                let root = PathInfo::resolve(volume, volume.root().to_path_buf()).await?;
                if root.attribute().visible() {
                    files.push(self.driver.descriptor(&root).await);
                }
            }
        }
        if init {
            response.api = Some(API_VERSION.to_string());
            response.upl_max_size = Some(
                target
                    .volume()
                    .max_upload_size()
                    .unwrap_or_default()
                    .to_string(),
            );
            response.net_drivers = Some(Vec::new());
        }
        Ok(response)
    }

    async fn upload(
        &self,
        mut command: ConnectorCommand,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        let target = self.target(&command).await?;
        let invalid = || ConnectorError::CommandParams(Command::Upload.to_string());

        let Some(chunk) = command.non_empty("chunk").map(str::to_string) else {
            let request = UploadRequest {
                paths: command.values("upload_path[]").to_vec(),
                policy: command.conflict_policy(),
                files: std::mem::take(&mut command.files),
            };
            if request.files.is_empty() {
                return Err(invalid());
            }
            return self.driver.upload(&target, request, token).await;
        };

        if is_chunk_part(&chunk) {
            let cid = command.non_empty("cid").ok_or_else(invalid)?.to_string();
            if command.files.len() != 1 {
                return Err(invalid());
            }
            let content = command.files.remove(0).content;
            let part = ChunkUpload::parse(&chunk, &cid, command.non_empty("range"), content)?;
            let _guard = self.manager.lock(&format!("chunk:{cid}")).await;
            self.driver.upload_chunk(&target, part, token).await
        } else {
            // Final request of a chunked upload: merge the staged file.
            let name = command
                .values("upload[]")
                .first()
                .filter(|n| !n.is_empty())
                .ok_or_else(invalid)?;
            let _guard = self.manager.lock(&format!("chunk:{chunk}")).await;
            self.driver
                .commit_chunk(&target, &chunk, name, &command.conflict_policy())
                .await
        }
    }

    async fn search(
        &self,
        command: &ConnectorCommand,
        token: &CancellationToken,
    ) -> Result<ConnectorResponse> {
        let query = command.arg("q").unwrap_or_default().trim();
        let mimes = command.values("mimes[]");
        if query.is_empty() && mimes.is_empty() {
            return Err(ConnectorError::CommandParams(Command::Search.to_string()));
        }

        let files = match command.non_empty("target") {
            Some(hash) => {
                let target = self.driver.resolve(hash).await?;
                self.driver.search(&target, query, mimes, token).await?
            }
            None => {
                let mut files = Vec::new();
                for volume in self.driver.volumes() {
                    let root = PathInfo::resolve(volume, volume.root().to_path_buf()).await?;
                    if !root.attribute().read() {
                        continue;
                    }
                    files.extend(self.driver.search(&root, query, mimes, token).await?);
                }
                files
            }
        };
        Ok(ConnectorResponse {
            files: Some(files),
            ..Default::default()
        })
    }

    /// Phase one stages an archive; phase two (`download=1`) streams it.
    ///
    /// In phase two `targets[]` carries `[cwd, key, name, mime]`.
    async fn zipdl(
        &self,
        command: &ConnectorCommand,
        token: &CancellationToken,
    ) -> Result<ConnectorResult> {
        if command.flag("download") {
            let values = command.values("targets[]");
            let [_, key, name, mime, ..] = values else {
                return Err(ConnectorError::CommandParams(Command::Zipdl.to_string()));
            };
            let file = self.driver.zipdl_file(key, name, mime).await?;
            return Ok(ConnectorResult::File(file));
        }

        let targets = self.targets(command, Command::Zipdl).await?;
        let zipdl = self.driver.zipdl(&targets, token).await?;
        Ok(ConnectorResponse {
            zipdl: Some(zipdl),
            ..Default::default()
        }
        .into())
    }
}

fn resize_request(command: &ConnectorCommand) -> Result<ResizeRequest> {
    let cmd = Command::Resize;
    let mode = match command.arg("mode").unwrap_or_default() {
        "resize" => ResizeMode::Resize {
            width: command.number("width", cmd)?,
            height: command.number("height", cmd)?,
        },
        "crop" => ResizeMode::Crop {
            x: command.number("x", cmd)?,
            y: command.number("y", cmd)?,
            width: command.number("width", cmd)?,
            height: command.number("height", cmd)?,
        },
        "rotate" => ResizeMode::Rotate {
            degrees: command.number("degree", cmd)?,
        },
        _ => return Err(ConnectorError::CommandParams(cmd.to_string())),
    };
    let quality = match command.non_empty("quality") {
        Some(_) => command.number::<u32>("quality", cmd)?.clamp(1, 100) as u8,
        None => DEFAULT_QUALITY,
    };
    Ok(ResizeRequest { mode, quality })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PathCodec;
    use crate::driver::tests::{fixture, fixture_with, Fixture};

    fn connector(fixture: &Fixture) -> Connector {
        Connector::new(fixture.driver.clone(), Arc::new(ConnectorManager::default()))
    }

    fn error_code(result: &ConnectorResult) -> String {
        result.error().unwrap().error[0].clone()
    }

    #[tokio::test]
    async fn test_command_validation() {
        let fixture = fixture();
        let connector = connector(&fixture);

        let result = connector.process(ConnectorCommand::default()).await;
        assert_eq!(error_code(&result), "errCmdReq");

        let result = connector.process(ConnectorCommand::new("format")).await;
        assert_eq!(error_code(&result), "errUnknownCmd");

        let result = connector.process(ConnectorCommand::new("mkfile")).await;
        assert_eq!(error_code(&result), "errCmdParams");
        assert_eq!(result.error().unwrap().status, 400);
    }

    #[tokio::test]
    async fn test_disabled_command() {
        let fixture = fixture();
        let connector = connector(&fixture).with_disabled(&["rm".to_string(), "nope".to_string()]);
        let root = fixture.root().await;
        let result = connector
            .process(ConnectorCommand::new("rm").with_arg("targets[]", root.hash()))
            .await;
        assert_eq!(error_code(&result), "errCmdNoSupport");
    }

    #[tokio::test]
    async fn test_open_init_defaults_to_first_root() {
        let fixture = fixture();
        let connector = connector(&fixture);
        let result = connector
            .process(ConnectorCommand::new("open").with_arg("init", "1"))
            .await;
        let response = result.response().unwrap();
        assert_eq!(response.api.as_deref(), Some("2.1"));
        assert_eq!(response.upl_max_size.as_deref(), Some("0"));
        assert_eq!(
            response.cwd.as_ref().unwrap().hash,
            fixture.root().await.hash()
        );

        let result = connector
            .process(
                ConnectorCommand::new("open")
                    .with_arg("init", "1")
                    .with_arg("target", "v1_bm9wZQ"),
            )
            .await;
        assert!(result.is_success());

        let result = connector.process(ConnectorCommand::new("open")).await;
        assert_eq!(error_code(&result), "errCmdParams");
    }

    #[tokio::test]
    async fn test_rm_skips_nested_targets() {
        let fixture = fixture();
        std::fs::create_dir_all(fixture.volume.root().join("dirA")).unwrap();
        std::fs::write(fixture.volume.root().join("dirA/fileX"), b"x").unwrap();
        let dir = fixture.info("dirA").await;
        let file = fixture.info("dirA/fileX").await;

        let connector = connector(&fixture);
        let result = connector
            .process(
                ConnectorCommand::new("rm")
                    .with_arg("targets[]", dir.hash())
                    .with_arg("targets[]", file.hash()),
            )
            .await;
        let response = result.response().unwrap();
        assert_eq!(response.removed.as_ref().unwrap(), &vec![dir.hash().to_string()]);
        assert!(response.warning.is_none());
        assert!(!fixture.volume.root().join("dirA").exists());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let fixture = fixture();
        let connector = connector(&fixture);
        let hash = format!("v1_{}", PathCodec::new().encode("/../outside"));
        let result = connector
            .process(ConnectorCommand::new("ls").with_arg("target", hash))
            .await;
        assert_eq!(error_code(&result), "errPerm");
    }

    #[tokio::test]
    async fn test_upload_limit_single_file_propagates() {
        let fixture = fixture_with(|v| v.with_max_upload_size(2));
        let connector = connector(&fixture);
        let root = fixture.root().await;
        let result = connector
            .process(
                ConnectorCommand::new("upload")
                    .with_arg("target", root.hash())
                    .with_file(UploadFile::new("big.txt", "hello")),
            )
            .await;
        assert_eq!(error_code(&result), "errUploadFileSize");
    }

    #[tokio::test]
    async fn test_chunked_upload_dispatch() {
        let fixture = fixture();
        let connector = connector(&fixture);
        let root = fixture.root().await;

        for (index, part) in ["abc", "def"].iter().enumerate() {
            let result = connector
                .process(
                    ConnectorCommand::new("upload")
                        .with_arg("target", root.hash())
                        .with_arg("chunk", format!("big.bin.{index}_1.part"))
                        .with_arg("cid", "c1")
                        .with_arg("range", format!("{},3,6", index * 3))
                        .with_file(UploadFile::new("blob", *part)),
                )
                .await;
            assert!(result.is_success(), "{result:?}");
            if index == 1 {
                let response = result.response().unwrap();
                let key = response.chunk_merged.clone().unwrap();
                assert_eq!(response.chunk_name.as_deref(), Some("big.bin"));

                let result = connector
                    .process(
                        ConnectorCommand::new("upload")
                            .with_arg("target", root.hash())
                            .with_arg("chunk", key)
                            .with_arg("upload[]", "big.bin"),
                    )
                    .await;
                assert!(result.is_success(), "{result:?}");
            }
        }
        assert_eq!(
            std::fs::read(fixture.volume.root().join("big.bin")).unwrap(),
            b"abcdef"
        );
    }

    #[tokio::test]
    async fn test_abort_cancels_registered_request() {
        let fixture = fixture();
        let connector = connector(&fixture);
        let registration = connector.manager().register("req-9");
        let token = registration.token().clone();

        let result = connector
            .process(ConnectorCommand::new("abort").with_arg("id", "req-9"))
            .await;
        assert!(result.is_success());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_request_unregistered_after_command() {
        let fixture = fixture();
        let connector = connector(&fixture);
        let root = fixture.root().await;
        let result = connector
            .process(
                ConnectorCommand::new("size")
                    .with_arg("targets[]", root.hash())
                    .with_request_id("req-1"),
            )
            .await;
        assert!(result.is_success());
        assert!(!connector.manager().is_registered("req-1"));
    }

    #[tokio::test]
    async fn test_search_all_volumes() {
        let fixture = fixture();
        std::fs::write(fixture.volume.root().join("report.txt"), b"r").unwrap();
        std::fs::write(fixture.volume.root().join("other.txt"), b"o").unwrap();
        let connector = connector(&fixture);
        let result = connector
            .process(ConnectorCommand::new("search").with_arg("q", "report"))
            .await;
        let files = result.response().unwrap().files.clone().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "report.txt");
    }

    #[tokio::test]
    async fn test_zipdl_two_phases() {
        let fixture = fixture();
        std::fs::write(fixture.volume.root().join("a.txt"), b"hello").unwrap();
        let file = fixture.info("a.txt").await;
        let root = fixture.root().await;
        let connector = connector(&fixture);

        let result = connector
            .process(ConnectorCommand::new("zipdl").with_arg("targets[]", file.hash()))
            .await;
        let zipdl = result.response().unwrap().zipdl.clone().unwrap();

        let result = connector
            .process(
                ConnectorCommand::new("zipdl")
                    .with_arg("download", "1")
                    .with_arg("targets[]", root.hash())
                    .with_arg("targets[]", zipdl.file.clone())
                    .with_arg("targets[]", zipdl.name.clone())
                    .with_arg("targets[]", zipdl.mime.clone()),
            )
            .await;
        match result {
            ConnectorResult::File(file) => {
                assert!(file.attachment);
                assert!(file.delete_after);
                assert!(file.path.is_file());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resize_params() {
        let command = ConnectorCommand::new("resize")
            .with_arg("mode", "crop")
            .with_arg("x", "1")
            .with_arg("y", "2")
            .with_arg("width", "3")
            .with_arg("height", "4")
            .with_arg("quality", "250");
        let request = resize_request(&command).unwrap();
        assert_eq!(
            request.mode,
            ResizeMode::Crop {
                x: 1,
                y: 2,
                width: 3,
                height: 4
            }
        );
        assert_eq!(request.quality, 100);

        let command = ConnectorCommand::new("resize").with_arg("mode", "rotate");
        assert!(resize_request(&command).is_err());
    }
}
