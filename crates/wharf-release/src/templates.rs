//! Materializing a template version as a chart directory

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::TemplateFile;

/// Write `files` under `root` and return the chart directory.
///
/// The chart directory is `root` joined with the first path component of the
/// first file, which is how template versions lay out their chart. File names
/// must be relative and may not climb out of `root`.
pub async fn write_chart_dir(root: &Path, files: &[TemplateFile]) -> Result<PathBuf> {
    let first = files
        .first()
        .ok_or_else(|| Error::Template("template version has no files".into()))?;

    for file in files {
        let relative = checked_relative(&file.name)?;
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        tokio::fs::write(&path, file.contents.as_bytes())
            .await
            .map_err(|e| Error::io(&path, e))?;
        debug!(path = %path.display(), bytes = file.contents.len(), "Wrote chart file");
    }

    let top = checked_relative(&first.name)?
        .components()
        .next()
        .ok_or_else(|| Error::Template(format!("empty file name: {:?}", first.name)))?;
    Ok(root.join(top))
}

/// Reject absolute paths and `..` so template content stays inside the cache
fn checked_relative(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    if name.is_empty() {
        return Err(Error::Template("empty file name".into()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::Template(format!(
                    "file name escapes the chart directory: {name}"
                )))
            }
        }
    }
    Ok(path)
}
