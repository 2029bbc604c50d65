//! Local file store for uploaded spreadsheets.
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Copy an uploaded spreadsheet into the data dir under a unique name and
/// return the staged path. The staged copy is owned by exactly one ingestion
/// job from here on.
pub async fn stage_upload(data_dir: &str, source: &Path) -> Result<String> {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("csv");
    let target = Path::new(data_dir)
        .join("uploads")
        .join(format!("{}.{}", Uuid::new_v4(), ext));
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::copy(source, &target)
        .await
        .with_context(|| format!("failed to stage upload from {}", source.display()))?;
    Ok(target.to_string_lossy().to_string())
}

/// Idempotent delete; a missing file is a no-op, not an error.
pub async fn remove_upload(path: &str) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!(path, "upload deleted");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to delete upload {}", path)),
    }
}
