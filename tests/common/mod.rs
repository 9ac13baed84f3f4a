//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use filedock::config::VolumeConfig;
use filedock::driver::{Driver, UploadFile};
use filedock::{Backend, Config, ConnectorCommand, ConnectorResult, Volume};
use tempfile::TempDir;

/// A backend over one volume rooted in a temporary directory.
pub struct TestBackend {
    pub dir: TempDir,
    pub backend: Backend,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::with_volume(|_| {})
    }

    pub fn with_volume(configure: impl FnOnce(&mut VolumeConfig)) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = Config::default();
        config.connector.temp_dir = dir.path().join("tmp").to_string_lossy().into_owned();
        let mut volume = VolumeConfig::new(dir.path().join("files").to_string_lossy());
        volume.name = Some("Files".to_string());
        configure(&mut volume);
        config.volumes.push(volume);
        let backend = Backend::build(&config).expect("Failed to build backend");
        Self { dir, backend }
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.backend.connector().driver().volumes()[0]
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.volume().root().join(relative)
    }

    pub fn hash(&self, relative: &str) -> String {
        self.volume().hash_of(&self.path(relative)).expect("Failed to hash path")
    }

    pub fn root_hash(&self) -> String {
        self.volume()
            .hash_of(self.volume().root())
            .expect("Failed to hash root")
    }

    pub async fn run(&self, command: ConnectorCommand) -> ConnectorResult {
        self.backend.connector().process(command).await
    }

    pub async fn upload(&self, name: &str, bytes: usize) -> ConnectorResult {
        self.run(
            ConnectorCommand::new("upload")
                .with_arg("target", self.root_hash())
                .with_file(UploadFile::new(name, vec![b'x'; bytes])),
        )
        .await
    }

    pub async fn usage(&self) -> u64 {
        self.backend
            .quota()
            .usage(self.volume())
            .await
            .expect("Failed to read usage")
    }
}

/// Error array of a failed result.
pub fn error_of(result: &ConnectorResult) -> Vec<String> {
    result
        .error()
        .unwrap_or_else(|| panic!("expected an error, got {result:?}"))
        .error
        .clone()
}
