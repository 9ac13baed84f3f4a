//! Picture and video editing capabilities.
//!
//! The driver only talks to [`PictureEditor`] and [`VideoEditor`]; the raster
//! implementation is [`ImageEditor`], backed by the `image` crate and run on
//! the blocking pool.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::{ConnectorError, Result};

/// Default JPEG quality for edited pictures.
pub const DEFAULT_QUALITY: u8 = 85;

/// Raster image operations.
#[async_trait]
pub trait PictureEditor: Send + Sync {
    /// Whether this editor understands the file.
    fn can_process(&self, path: &Path) -> bool;

    /// Width and height in pixels.
    async fn dimensions(&self, path: &Path) -> Result<(u32, u32)>;

    /// Write a PNG thumbnail fitting in `size`x`size` to `dest`.
    async fn thumbnail(&self, source: &Path, dest: &Path, size: u32) -> Result<()>;

    /// Scale to exactly `width`x`height`, in place.
    async fn resize(&self, path: &Path, width: u32, height: u32, quality: u8) -> Result<()>;

    /// Cut out a rectangle, in place.
    async fn crop(
        &self,
        path: &Path,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<()>;

    /// Rotate clockwise by a multiple of 90 degrees, in place.
    async fn rotate(&self, path: &Path, degrees: i32, quality: u8) -> Result<()>;
}

/// Video thumbnail extraction.
#[async_trait]
pub trait VideoEditor: Send + Sync {
    fn can_process(&self, path: &Path) -> bool;

    async fn thumbnail(&self, source: &Path, dest: &Path, size: u32) -> Result<()>;
}

/// [`PictureEditor`] for PNG, JPEG and GIF files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageEditor;

impl ImageEditor {
    pub fn new() -> Self {
        Self
    }

    fn format_of(path: &Path) -> Option<ImageFormat> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("png") => Some(ImageFormat::Png),
            Some("jpg") | Some("jpeg") => Some(ImageFormat::Jpeg),
            Some("gif") => Some(ImageFormat::Gif),
            _ => None,
        }
    }

    fn load(path: &Path) -> Result<DynamicImage> {
        image::open(path).map_err(|e| ConnectorError::Image(e.to_string()))
    }

    /// Write `image` back to `path` in the format its extension names.
    fn store(image: &DynamicImage, path: &Path, quality: u8) -> Result<()> {
        match Self::format_of(path) {
            Some(ImageFormat::Jpeg) => {
                let mut writer = BufWriter::new(File::create(path)?);
                JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100))
                    .encode_image(&image.to_rgb8())
                    .map_err(|e| ConnectorError::Image(e.to_string()))
            }
            Some(format) => image
                .save_with_format(path, format)
                .map_err(|e| ConnectorError::Image(e.to_string())),
            None => Err(ConnectorError::Image(format!(
                "unsupported image type: {}",
                path.display()
            ))),
        }
    }

    async fn edit<F>(path: &Path, quality: u8, transform: F) -> Result<()>
    where
        F: FnOnce(DynamicImage) -> Result<DynamicImage> + Send + 'static,
    {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let image = transform(Self::load(&path)?)?;
            Self::store(&image, &path, quality)
        })
        .await?
    }
}

#[async_trait]
impl PictureEditor for ImageEditor {
    fn can_process(&self, path: &Path) -> bool {
        Self::format_of(path).is_some()
    }

    async fn dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            ImageReader::open(&path)?
                .with_guessed_format()?
                .into_dimensions()
                .map_err(|e| ConnectorError::Image(e.to_string()))
        })
        .await?
    }

    async fn thumbnail(&self, source: &Path, dest: &Path, size: u32) -> Result<()> {
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let image = Self::load(&source)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            image
                .thumbnail(size, size)
                .save_with_format(&dest, ImageFormat::Png)
                .map_err(|e| ConnectorError::Image(e.to_string()))
        })
        .await?
    }

    async fn resize(&self, path: &Path, width: u32, height: u32, quality: u8) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(ConnectorError::CommandParams("resize".to_string()));
        }
        Self::edit(path, quality, move |image| {
            Ok(image.resize_exact(width, height, FilterType::Lanczos3))
        })
        .await
    }

    async fn crop(
        &self,
        path: &Path,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<()> {
        Self::edit(path, quality, move |image| {
            let fits = x.checked_add(width).is_some_and(|r| r <= image.width())
                && y.checked_add(height).is_some_and(|b| b <= image.height());
            if width == 0 || height == 0 || !fits {
                return Err(ConnectorError::CommandParams("resize".to_string()));
            }
            Ok(image.crop_imm(x, y, width, height))
        })
        .await
    }

    async fn rotate(&self, path: &Path, degrees: i32, quality: u8) -> Result<()> {
        let degrees = degrees.rem_euclid(360);
        if degrees % 90 != 0 {
            return Err(ConnectorError::CommandParams("resize".to_string()));
        }
        Self::edit(path, quality, move |image| {
            Ok(match degrees {
                90 => image.rotate90(),
                180 => image.rotate180(),
                270 => image.rotate270(),
                _ => image,
            })
        })
        .await
    }
}
