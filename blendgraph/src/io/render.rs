//! Rendering a script through the camera rig.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{debug, instrument, warn};

use crate::io::script::{ScriptExecutor, write_and_execute};

const CAMERA_TEMPLATE: &str = include_str!("../../templates/camera.py.j2");

/// Renders a script to images.
///
/// Implementations must return paths in lexicographic order; before/after
/// comparisons zip them positionally. An empty list means nothing rendered.
pub trait Renderer {
    fn render(&self, script: &str, out_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Appends the camera rig to the script and runs it through a script executor.
pub struct BlenderRenderer<E> {
    executor: E,
    n_images: usize,
    no_error_sentinel: String,
}

impl<E: ScriptExecutor> BlenderRenderer<E> {
    pub fn new(executor: E, n_images: usize, no_error_sentinel: impl Into<String>) -> Self {
        Self {
            executor,
            n_images,
            no_error_sentinel: no_error_sentinel.into(),
        }
    }
}

impl<E: ScriptExecutor> Renderer for BlenderRenderer<E> {
    #[instrument(skip_all, fields(out_dir = %out_dir.display(), n_images = self.n_images))]
    fn render(&self, script: &str, out_dir: &Path) -> Result<Vec<PathBuf>> {
        // Stale images would be mistaken for this pass's output.
        if out_dir.exists() {
            fs::remove_dir_all(out_dir)
                .with_context(|| format!("clear render dir {}", out_dir.display()))?;
        }
        fs::create_dir_all(out_dir)
            .with_context(|| format!("create render dir {}", out_dir.display()))?;
        let combined = combine_with_camera(script, out_dir, self.n_images)?;
        let report = write_and_execute(&self.executor, &out_dir.join("render.py"), &combined)?;
        if let Some(err) = report.failure(&self.no_error_sentinel) {
            warn!(err = %err, "render script reported an error");
        }
        let images = list_images(out_dir)?;
        debug!(count = images.len(), "rendered images");
        Ok(images)
    }
}

/// Script followed by the camera rig that writes PNGs into `save_dir`.
pub fn combine_with_camera(script: &str, save_dir: &Path, n_images: usize) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("camera.py", CAMERA_TEMPLATE)
        .context("load camera template")?;
    let rig = env
        .get_template("camera.py")?
        .render(context! {
            save_dir => save_dir.display().to_string(),
            n_images => n_images,
        })
        .context("render camera template")?;
    Ok(format!("{}\n{rig}", script.trim_end()))
}

/// PNG files in `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
        if is_png && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
