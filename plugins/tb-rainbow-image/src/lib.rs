//! Rainbow image plugin
//!
//! Renders a rainbow arc row by row. Rendering can be interrupted: when the
//! host saves with `exiting = true` while rows remain, the request, the next
//! row and the partial pixel buffer are persisted, and a later session
//! continues with `resume`.
//!
//! Settings layout (schema 1):
//!
//! ```text
//! pending: bool
//! if pending: ImageMapInformation, next_row: u32
//! ```
//!
//! The partial RGBA buffer lives next to the settings file in
//! `<settings file>.partial`.
//!
//! Only PNG is written. A main file name with another extension fails the
//! request; an intermediate one with another extension disables previews.

pub mod render;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use render::{is_png, render_row, write_png, BYTES_PER_PIXEL};
use tb_plugins::prelude::*;

pub const SETTINGS_VERSION: u32 = 1;

/// Rows between refreshes of the intermediate preview
pub const INTERMEDIATE_EVERY_ROWS: u32 = 64;

/// Sidecar holding the partial pixel buffer for a settings file
pub fn partial_path(settings: &Path) -> PathBuf {
    let mut name = settings
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    settings.with_file_name(name)
}

/// An image being rendered
#[derive(Debug, Clone, PartialEq)]
struct RenderJob {
    map: ImageMapInformation,
    next_row: u32,
    pixels: Vec<u8>,
}

impl RenderJob {
    fn new(map: &ImageMapInformation) -> Result<Self, AcquisitionFailure> {
        let (width, height) = dimensions(map).ok_or_else(|| {
            AcquisitionFailure::new(format!(
                "Invalid image size {}x{}",
                map.width, map.height
            ))
        })?;
        if !is_png(Path::new(&map.filename)) {
            return Err(AcquisitionFailure::new(format!(
                "Only PNG output is supported, cannot write {}",
                map.filename
            )));
        }

        let too_large = || {
            AcquisitionFailure::new(format!(
                "Image {}x{} is too large to render in memory",
                map.width, map.height
            ))
        };
        let len = buffer_len(width, height).ok_or_else(too_large)?;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len).map_err(|_| too_large())?;
        pixels.resize(len, 0);

        Ok(Self {
            map: map.clone(),
            next_row: 0,
            pixels,
        })
    }

    fn width(&self) -> u32 {
        self.map.width as u32
    }

    fn height(&self) -> u32 {
        self.map.height as u32
    }

    fn is_finished(&self) -> bool {
        self.next_row >= self.height()
    }

    fn row_bytes(&self) -> usize {
        self.width() as usize * BYTES_PER_PIXEL
    }

    fn preview_path(&self, xpacks: &Path) -> Option<PathBuf> {
        if self.map.filename_intermediate.is_empty() {
            return None;
        }
        let path = self.map.intermediate_path(xpacks);
        if !is_png(&path) {
            warn!(path = %path.display(), "Intermediate is not a PNG file; previews disabled");
            return None;
        }
        Some(path)
    }
}

fn dimensions(map: &ImageMapInformation) -> Option<(u32, u32)> {
    if map.width > 0 && map.height > 0 {
        Some((map.width as u32, map.height as u32))
    } else {
        None
    }
}

fn buffer_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(BYTES_PER_PIXEL)
}

#[derive(Default)]
pub struct RainbowImage {
    job: Option<RenderJob>,
}

impl RainbowImage {
    /// Row the next `resume` starts from, if an unfinished render is held
    pub fn next_row(&self) -> Option<u32> {
        self.job
            .as_ref()
            .filter(|job| !job.is_finished())
            .map(|job| job.next_row)
    }

    fn render(&mut self, xpacks: &Path, ctx: &AcquisitionContext) -> Result<(), AcquisitionFailure> {
        let Some(job) = self.job.as_mut() else {
            return Ok(());
        };
        let (width, height) = (job.width(), job.height());
        let row_bytes = job.row_bytes();
        debug!(width, height, start_row = job.next_row, "Rendering rainbow");

        let preview = job.preview_path(xpacks);

        while job.next_row < height {
            if ctx.is_cancelled() {
                info!(row = job.next_row, "Rainbow render interrupted");
                return Ok(());
            }

            let y = job.next_row;
            let start = y as usize * row_bytes;
            render_row(y, width, height, &mut job.pixels[start..start + row_bytes]);
            job.next_row += 1;

            ctx.report_progress(
                ImageType::Main,
                job.next_row as f32 / height as f32 * 100.0,
            );

            if let Some(preview) = preview.as_ref().filter(|_| job.next_row % INTERMEDIATE_EVERY_ROWS == 0) {
                if let Err(e) = write_png(preview, width, height, &job.pixels) {
                    warn!(path = %preview.display(), error = %e, "Failed to refresh preview");
                }
            }
        }

        let target = job.map.main_path(xpacks);
        write_png(&target, width, height, &job.pixels).map_err(|e| {
            AcquisitionFailure::new(format!("Failed to write {}: {}", target.display(), e))
        })?;
        info!(path = %target.display(), "Rainbow image written");
        self.job = None;
        Ok(())
    }
}

impl Plugin for RainbowImage {
    fn description(&self) -> &str {
        "Rainbow Image"
    }

    fn about(&self) -> &str {
        "Create a rainbow image."
    }

    fn supported_engines(&self) -> Vec<GameEngine> {
        vec![GameEngine::All]
    }

    fn load(&mut self, path: &Path) -> Result<(), PersistenceError> {
        self.job = None;
        let Some(mut reader) = SettingsReader::open(path, SETTINGS_VERSION)? else {
            return Ok(());
        };
        if !reader.read_bool()? {
            return Ok(());
        }

        let map = reader.read_map()?;
        let next_row = reader.read_u32()?;
        let (width, height) = dimensions(&map).ok_or_else(|| {
            PersistenceError::InvalidValue(format!("image size {}x{}", map.width, map.height))
        })?;
        if next_row > height {
            return Err(PersistenceError::InvalidValue(format!(
                "next row {} beyond height {}",
                next_row, height
            )));
        }

        let expected = buffer_len(width, height).ok_or_else(|| {
            PersistenceError::InvalidValue(format!("image size {}x{} is too large", width, height))
        })?;
        let pixels = fs::read(partial_path(path))?;
        if pixels.len() != expected {
            return Err(PersistenceError::InvalidValue(format!(
                "partial buffer holds {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }

        debug!(next_row, height, "Restored unfinished rainbow render");
        self.job = Some(RenderJob {
            map,
            next_row,
            pixels,
        });
        Ok(())
    }
}

impl ImagePlugin for RainbowImage {
    fn supports_interruptions(&self) -> bool {
        true
    }

    fn has_pending_work(&self) -> bool {
        self.next_row().is_some()
    }

    fn set_coverage(&self, map: &mut ImageMapInformation, desired_width: f64, desired_height: f64) {
        map.coverage_x = desired_width.max(desired_height);
        map.coverage_z = map.coverage_x;
    }

    fn create(
        &mut self,
        xpacks: &Path,
        map: &ImageMapInformation,
        ctx: &AcquisitionContext,
    ) -> Result<(), AcquisitionFailure> {
        self.job = Some(RenderJob::new(map)?);
        self.render(xpacks, ctx)
    }

    fn resume(&mut self, xpacks: &Path, ctx: &AcquisitionContext) -> Result<(), AcquisitionFailure> {
        self.render(xpacks, ctx)
    }

    fn save(&mut self, path: &Path, exiting: bool) -> Result<(), PersistenceError> {
        let pending = if exiting {
            self.job.as_ref().filter(|job| !job.is_finished())
        } else {
            None
        };

        let mut writer = SettingsWriter::create(path, SETTINGS_VERSION)?;
        writer.write_bool(pending.is_some())?;
        let sidecar = partial_path(path);
        match pending {
            Some(job) => {
                writer.write_map(&job.map)?;
                writer.write_u32(job.next_row)?;
                write_atomically(&sidecar, &job.pixels)?;
            }
            None => match fs::remove_file(&sidecar) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        writer.finish()
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

export_image_plugin!(RainbowImage);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tb_plugins::CancelToken;

    fn request(width: i32, height: i32) -> ImageMapInformation {
        ImageMapInformation {
            filename: "rainbow/main.png".into(),
            filename_intermediate: "rainbow/main_preview.png".into(),
            width,
            height,
            ..Default::default()
        }
    }

    #[test]
    fn test_symmetric_coverage() {
        let mut map = ImageMapInformation::default();
        RainbowImage::default().set_coverage(&mut map, 1200.0, 800.0);
        assert_eq!((map.coverage_x, map.coverage_z), (1200.0, 1200.0));
    }

    #[test]
    fn test_create_writes_final_and_preview() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = RainbowImage::default();
        plugin
            .create(dir.path(), &request(16, 128), &AcquisitionContext::detached())
            .unwrap();

        assert!(dir.path().join("rainbow/main.png").is_file());
        assert!(dir.path().join("rainbow/main_preview.png").is_file());
        assert!(!plugin.has_pending_work());
    }

    #[test]
    fn test_invalid_size_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = RainbowImage::default()
            .create(dir.path(), &request(0, 10), &AcquisitionContext::detached())
            .unwrap_err();
        assert!(err.message().contains("0x10"));
    }

    #[test]
    fn test_oversized_image_fails_instead_of_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let err = RainbowImage::default()
            .create(dir.path(), &request(i32::MAX, i32::MAX), &AcquisitionContext::detached())
            .unwrap_err();
        assert!(err.message().contains("too large"));
    }

    #[test]
    fn test_non_png_main_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let map = ImageMapInformation {
            filename: "rainbow/main.jpg".into(),
            ..request(4, 4)
        };
        let mut plugin = RainbowImage::default();
        let err = plugin
            .create(dir.path(), &map, &AcquisitionContext::detached())
            .unwrap_err();
        assert!(err.message().contains("main.jpg"));
        assert!(!dir.path().join("rainbow/main.jpg").exists());
        assert!(!plugin.has_pending_work());
    }

    #[test]
    fn test_non_png_preview_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let map = ImageMapInformation {
            filename: "rainbow/main.PNG".into(),
            filename_intermediate: "rainbow/main_preview.jpg".into(),
            ..request(8, INTERMEDIATE_EVERY_ROWS as i32)
        };
        RainbowImage::default()
            .create(dir.path(), &map, &AcquisitionContext::detached())
            .unwrap();
        assert!(dir.path().join("rainbow/main.PNG").is_file());
        assert!(!dir.path().join("rainbow/main_preview.jpg").exists());
    }

    #[test]
    fn test_cancelled_render_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let ctx = AcquisitionContext::new(token, None);

        let mut plugin = RainbowImage::default();
        plugin.create(dir.path(), &request(8, 8), &ctx).unwrap();
        assert_eq!(plugin.next_row(), Some(0));
        assert!(!dir.path().join("rainbow/main.png").exists());
    }

    #[test]
    fn test_interrupted_render_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("Plugins/Image/rainbow.bin");

        let mut plugin = RainbowImage::default();
        let mut job = RenderJob::new(&request(4, 6)).unwrap();
        for y in 0..3 {
            let start = y as usize * job.row_bytes();
            let end = start + job.row_bytes();
            render_row(y, 4, 6, &mut job.pixels[start..end]);
        }
        job.next_row = 3;
        plugin.job = Some(job.clone());

        plugin.save(&settings, true).unwrap();
        assert!(partial_path(&settings).is_file());

        let mut restored = RainbowImage::default();
        restored.load(&settings).unwrap();
        assert_eq!(restored.job, Some(job));
        assert!(restored.has_pending_work());

        restored
            .resume(dir.path(), &AcquisitionContext::detached())
            .unwrap();
        assert!(dir.path().join("rainbow/main.png").is_file());
        assert!(!restored.has_pending_work());
    }

    #[test]
    fn test_plain_save_drops_partial_state() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("rainbow.bin");
        let mut plugin = RainbowImage {
            job: Some(RenderJob::new(&request(2, 2)).unwrap()),
        };
        plugin.save(&settings, true).unwrap();
        plugin.save(&settings, false).unwrap();
        assert!(!partial_path(&settings).exists());

        let mut restored = RainbowImage::default();
        restored.load(&settings).unwrap();
        assert!(!restored.has_pending_work());
    }

    #[test]
    fn test_load_rejects_mismatched_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("rainbow.bin");
        let mut plugin = RainbowImage {
            job: Some(RenderJob::new(&request(2, 2)).unwrap()),
        };
        plugin.save(&settings, true).unwrap();
        fs::write(partial_path(&settings), [0u8; 3]).unwrap();

        let mut restored = RainbowImage::default();
        assert!(matches!(
            restored.load(&settings),
            Err(PersistenceError::InvalidValue(_))
        ));
        assert!(!restored.has_pending_work());
    }

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/p/Plugins/Image/rainbow.bin")),
            PathBuf::from("/p/Plugins/Image/rainbow.bin.partial")
        );
    }
}
