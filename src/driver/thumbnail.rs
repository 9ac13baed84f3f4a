//! Thumbnail generation.
//!
//! Each media kind has its own bounded queue drained by one worker task.
//! Workers log and skip items that fail so one bad file cannot stall a queue.
//! [`ThumbnailService::register`] wires the service into the driver hooks:
//! writes enqueue regeneration, removals and moves drop stale thumbnails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::hooks::{DriverHooks, MutationEvent, MutationKind, Outcome};
use super::picture::{PictureEditor, VideoEditor};
use crate::volume::Volume;
use crate::Result;

/// Media kinds with independent work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Picture,
    Video,
}

#[derive(Debug)]
struct ThumbnailJob {
    volume: Arc<Volume>,
    path: PathBuf,
}

#[derive(Clone)]
struct Renderer {
    picture: Arc<dyn PictureEditor>,
    video: Option<Arc<dyn VideoEditor>>,
    size: u32,
}

impl Renderer {
    fn media_kind(&self, path: &Path) -> Option<MediaKind> {
        if self.picture.can_process(path) {
            Some(MediaKind::Picture)
        } else if self.video.as_ref().is_some_and(|v| v.can_process(path)) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    async fn render(&self, volume: &Volume, path: &Path) -> Result<Option<String>> {
        let Some(kind) = self.media_kind(path) else {
            return Ok(None);
        };
        let name = volume.thumbnail_name(path)?;
        let dest = volume.thumbnail_dir().join(&name);
        match (kind, &self.video) {
            (MediaKind::Picture, _) => self.picture.thumbnail(path, &dest, self.size).await?,
            (MediaKind::Video, Some(video)) => video.thumbnail(path, &dest, self.size).await?,
            (MediaKind::Video, None) => return Ok(None),
        }
        Ok(Some(name))
    }
}

/// Thumbnail renderer with background work queues.
pub struct ThumbnailService {
    renderer: Renderer,
    queues: HashMap<MediaKind, mpsc::Sender<ThumbnailJob>>,
}

impl std::fmt::Debug for ThumbnailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailService")
            .field("size", &self.renderer.size)
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ThumbnailService {
    /// Create the service and spawn one worker per media kind.
    pub fn start(
        picture: Arc<dyn PictureEditor>,
        video: Option<Arc<dyn VideoEditor>>,
        size: u32,
        capacity: usize,
    ) -> Arc<Self> {
        let renderer = Renderer {
            picture,
            video,
            size,
        };
        let mut queues = HashMap::new();
        let mut kinds = vec![MediaKind::Picture];
        if renderer.video.is_some() {
            kinds.push(MediaKind::Video);
        }

        for kind in kinds {
            let (tx, mut rx) = mpsc::channel::<ThumbnailJob>(capacity.max(1));
            let worker = renderer.clone();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    match worker.render(&job.volume, &job.path).await {
                        Ok(_) => debug!(path = %job.path.display(), ?kind, "Thumbnail generated"),
                        Err(e) => warn!(
                            path = %job.path.display(),
                            ?kind,
                            error = %e,
                            "Thumbnail generation failed"
                        ),
                    }
                }
                debug!(?kind, "Thumbnail worker stopped");
            });
            queues.insert(kind, tx);
        }

        Arc::new(Self { renderer, queues })
    }

    /// Thumbnail edge size in pixels.
    pub fn size(&self) -> u32 {
        self.renderer.size
    }

    /// Media kind of a file, `None` when no thumbnail can be made.
    pub fn media_kind(&self, path: &Path) -> Option<MediaKind> {
        self.renderer.media_kind(path)
    }

    /// Render a thumbnail now. Returns the thumbnail file name.
    pub async fn render(&self, volume: &Volume, path: &Path) -> Result<Option<String>> {
        self.renderer.render(volume, path).await
    }

    /// Queue background regeneration. Returns whether the job was queued.
    pub fn enqueue(&self, volume: &Arc<Volume>, path: &Path) -> bool {
        let Some(queue) = self.media_kind(path).and_then(|k| self.queues.get(&k)) else {
            return false;
        };
        let job = ThumbnailJob {
            volume: Arc::clone(volume),
            path: path.to_path_buf(),
        };
        match queue.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Thumbnail queue rejected job");
                false
            }
        }
    }

    /// Register the regeneration and cleanup hooks.
    pub fn register(self: &Arc<Self>, hooks: &DriverHooks) {
        const REGENERATE: [MutationKind; 6] = [
            MutationKind::Upload,
            MutationKind::Write,
            MutationKind::Resize,
            MutationKind::Copy,
            MutationKind::ChunkMerge,
            MutationKind::Move,
        ];
        const DROP_STALE: [MutationKind; 3] =
            [MutationKind::Remove, MutationKind::Move, MutationKind::Resize];

        for kind in DROP_STALE {
            hooks.for_kind(kind).on_after(|event, outcome| async move {
                if matches!(outcome, Outcome::Completed(_)) {
                    drop_stale(&event).await;
                }
                Ok(())
            });
        }
        for kind in REGENERATE {
            let service = Arc::clone(self);
            hooks.for_kind(kind).on_after(move |event, outcome| {
                let service = Arc::clone(&service);
                async move {
                    if matches!(outcome, Outcome::Completed(_)) && !event.target.is_dir {
                        service.enqueue(&event.target.volume, &event.target.path);
                    }
                    Ok(())
                }
            });
        }
    }
}

/// Delete the thumbnail of whatever the mutation took away.
async fn drop_stale(event: &MutationEvent) {
    let stale = match event.kind {
        MutationKind::Move => event.source.as_ref(),
        _ => Some(&event.target),
    };
    let Some(stale) = stale.filter(|t| !t.is_dir) else {
        return;
    };
    if let Ok(thumbnail) = stale.volume.thumbnail_path(&stale.path) {
        match tokio::fs::remove_file(&thumbnail).await {
            Ok(()) => debug!(path = %thumbnail.display(), "Removed stale thumbnail"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %thumbnail.display(), error = %e, "Failed to remove thumbnail"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::hooks::{Delta, HookTarget};
    use crate::driver::picture::ImageEditor;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Volume>, Arc<ThumbnailService>) {
        let temp_dir = TempDir::new().unwrap();
        let volume = Arc::new(Volume::new("v1_", temp_dir.path()).unwrap());
        let service = ThumbnailService::start(Arc::new(ImageEditor::new()), None, 16, 8);
        (temp_dir, volume, service)
    }

    fn write_png(path: &Path) {
        RgbImage::from_pixel(64, 32, Rgb([1, 2, 3]))
            .save_with_format(path, ImageFormat::Png)
            .unwrap();
    }

    async fn wait_for(path: &Path) -> bool {
        for _ in 0..100 {
            if path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_render_now() {
        let (_temp_dir, volume, service) = setup();
        let source = volume.root().join("a.png");
        write_png(&source);

        let name = service.render(&volume, &source).await.unwrap().unwrap();
        assert!(volume.thumbnail_dir().join(name).exists());

        let text = volume.root().join("a.txt");
        std::fs::write(&text, b"x").unwrap();
        assert_eq!(service.render(&volume, &text).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_worker_survives_bad_item() {
        let (_temp_dir, volume, service) = setup();
        let broken = volume.root().join("broken.png");
        std::fs::write(&broken, b"not png").unwrap();
        let good = volume.root().join("good.png");
        write_png(&good);

        assert!(service.enqueue(&volume, &broken));
        assert!(service.enqueue(&volume, &good));
        assert!(!service.enqueue(&volume, &volume.root().join("notes.txt")));

        assert!(wait_for(&volume.thumbnail_path(&good).unwrap()).await);
        assert!(!volume.thumbnail_path(&broken).unwrap().exists());
    }

    #[tokio::test]
    async fn test_hooks_regenerate_and_drop() {
        let (_temp_dir, volume, service) = setup();
        let hooks = DriverHooks::default();
        service.register(&hooks);

        let path = volume.root().join("pic.png");
        let upload_path = path.clone();
        hooks
            .upload
            .run(
                MutationEvent::new(
                    MutationKind::Upload,
                    HookTarget::new(&volume, path.clone(), false),
                ),
                |_| async move {
                    write_png(&upload_path);
                    Ok(((), Delta::NONE))
                },
            )
            .await
            .unwrap();

        let thumbnail = volume.thumbnail_path(&path).unwrap();
        assert!(wait_for(&thumbnail).await);

        let remove_path = path.clone();
        hooks
            .remove
            .run(
                MutationEvent::new(MutationKind::Remove, HookTarget::new(&volume, path, false)),
                |_| async move {
                    std::fs::remove_file(&remove_path)?;
                    Ok(((), Delta::NONE))
                },
            )
            .await
            .unwrap();
        assert!(!thumbnail.exists());
    }
}
