//! Assembly of the connector stack from configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::connector::manager::ConnectorManager;
use crate::connector::Connector;
use crate::driver::picture::ImageEditor;
use crate::driver::temp::TempStore;
use crate::driver::thumbnail::ThumbnailService;
use crate::driver::{Driver, FileSystemDriver};
use crate::storage::quota::QuotaPolicy;
use crate::storage::StorageManager;
use crate::volume::Volume;
use crate::{audit, Result};

/// The wired connector plus the services behind it.
///
/// Background sweepers stop when this is dropped.
pub struct Backend {
    connector: Arc<Connector>,
    quota: Arc<QuotaPolicy>,
    temp: Arc<TempStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl Backend {
    /// Build every service and register the driver hooks.
    ///
    /// Hook order per operation is quota, thumbnails, audit. Must run inside
    /// a Tokio runtime.
    pub fn build(config: &Config) -> Result<Self> {
        config.validate()?;

        let volumes = config
            .volumes
            .iter()
            .enumerate()
            .map(|(index, volume)| Volume::from_config(volume, index).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let storage = Arc::new(StorageManager::new(&config.storage));
        let quota = Arc::new(QuotaPolicy::new(Arc::clone(&storage)));
        let manager = Arc::new(ConnectorManager::new(&config.connector));
        let temp = Arc::new(TempStore::new(
            &config.connector.temp_dir,
            Duration::from_secs(config.connector.temp_ttl_secs),
        )?);
        let picture = Arc::new(ImageEditor::new());
        let thumbnails = ThumbnailService::start(
            picture.clone(),
            None,
            config.thumbnails.size,
            config.thumbnails.queue_capacity,
        );

        let driver = Arc::new(
            FileSystemDriver::new(volumes, Arc::clone(&temp), Arc::clone(&thumbnails))
                .with_picture_editor(picture)
                .with_disabled(config.connector.disabled_commands.clone()),
        );
        quota.register(driver.hooks());
        thumbnails.register(driver.hooks());
        audit::register(driver.hooks());

        let tasks = vec![
            storage.start_sweeper(),
            manager.start_sweeper(),
            temp.start_sweeper(Duration::from_secs(
                config.connector.sweep_interval_secs.max(1),
            )),
        ];

        for volume in driver.volumes() {
            info!(
                volume = volume.id(),
                root = %volume.root().display(),
                max_storage = ?volume.max_storage(),
                "Volume mounted"
            );
        }

        let connector = Arc::new(
            Connector::new(driver, manager).with_disabled(&config.connector.disabled_commands),
        );
        Ok(Self {
            connector,
            quota,
            temp,
            tasks,
        })
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn quota(&self) -> &Arc<QuotaPolicy> {
        &self.quota
    }

    pub fn temp(&self) -> &Arc<TempStore> {
        &self.temp
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::connector::ConnectorCommand;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.connector.temp_dir = dir.path().join("tmp").to_string_lossy().into_owned();
        config.connector.disabled_commands = vec!["extract".to_string()];
        let mut volume = VolumeConfig::new(dir.path().join("files").to_string_lossy());
        volume.max_storage = Some(1000);
        config.volumes.push(volume);
        config
    }

    #[tokio::test]
    async fn test_build_wires_hooks() {
        let dir = TempDir::new().unwrap();
        let backend = Backend::build(&config(&dir)).unwrap();
        let hooks = backend.connector().driver().hooks();
        // quota + thumbnails + audit
        assert_eq!(hooks.upload.before_count(), 1);
        assert_eq!(hooks.upload.after_count(), 3);
        assert_eq!(hooks.chunk_transfer.before_count(), 1);
        assert_eq!(hooks.chunk_rollback.after_count(), 1);
    }

    #[tokio::test]
    async fn test_build_rejects_empty_config() {
        assert!(Backend::build(&Config::default()).is_err());
    }

    #[tokio::test]
    async fn test_disabled_command_from_config() {
        let dir = TempDir::new().unwrap();
        let backend = Backend::build(&config(&dir)).unwrap();
        let result = backend
            .connector()
            .process(ConnectorCommand::new("extract").with_arg("target", "v1_Lw"))
            .await;
        assert_eq!(result.error().unwrap().error[0], "errCmdNoSupport");

        let result = backend
            .connector()
            .process(ConnectorCommand::new("open").with_arg("init", "1"))
            .await;
        let options = result.response().unwrap().options.clone().unwrap();
        assert_eq!(options.disabled, vec!["extract".to_string()]);
    }
}
