//! Hand-off of captured images to the analysis pipeline.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::{CamError, Result};
use crate::strategy::CaptureResult;

/// Downstream consumer of successful captures.
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Deliver the image of a successful `result`. Returns where it went.
    async fn deliver(&self, camera_id: &str, result: &CaptureResult) -> Result<PathBuf>;
}

/// Writes `img_dir/<camera>/<timestamp>.jpg` plus a `.json` sidecar holding
/// the capture metadata.
pub struct DirectorySink {
    img_dir: PathBuf,
}

impl DirectorySink {
    pub fn new(img_dir: impl Into<PathBuf>) -> Self {
        Self { img_dir: img_dir.into() }
    }
}

#[async_trait]
impl ImageSink for DirectorySink {
    async fn deliver(&self, camera_id: &str, result: &CaptureResult) -> Result<PathBuf> {
        let image = result
            .image()
            .ok_or_else(|| CamError::Internal(format!("no image to deliver for {camera_id}")))?;

        let dir = self.img_dir.join(safe_component(camera_id));
        tokio::fs::create_dir_all(&dir).await?;

        let ts = result.timestamp.format("%Y%m%d%H%M%S%3f").to_string();
        let path = dir.join(format!("{ts}.jpg"));
        tokio::fs::write(&path, image).await?;

        let meta = serde_json::to_vec_pretty(result)?;
        if let Err(e) = tokio::fs::write(path.with_extension("json"), meta).await {
            warn!("cannot write metadata for {}: {e}", path.display());
        }
        debug!("image for {camera_id} saved to {}", path.display());
        Ok(path)
    }
}

fn safe_component(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::jpeg;

    #[tokio::test]
    async fn writes_image_and_metadata() {
        let dir = std::env::temp_dir().join(format!("classcam-img-{}", uuid::Uuid::new_v4()));
        let sink = DirectorySink::new(&dir);

        let result = CaptureResult::captured("imou_main", jpeg(2048));
        let path = sink.deliver("aula/1", &result).await.unwrap();
        assert!(path.starts_with(dir.join("aula_1")));
        assert_eq!(tokio::fs::read(&path).await.unwrap().len(), 2048);

        let meta: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(path.with_extension("json")).await.unwrap()).unwrap();
        assert_eq!(meta["method"], "imou_main");
        assert_eq!(meta["fileSizeBytes"], 2048);
        assert!(meta.get("image").is_none());

        let failed = CaptureResult::failed(&CamError::Connection("down".into()), Vec::new());
        assert!(sink.deliver("aula-2", &failed).await.is_err());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
