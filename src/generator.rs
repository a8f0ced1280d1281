//! Screenshot generator used by the post-build batch
//!
//! A [`ScreenshotGenerator`] owns one browser backend for its whole life.
//! It only exists once the backend is up, so the "not yet launched" states
//! are represented by [`ScreenshotGenerator::launch`] not having resolved.
//! After [`ScreenshotGenerator::dispose`] every call to `generate` yields an
//! empty image.

use crate::{CaptureBackend, ChromiumBackend, ImageFormat, LinkPreviewError, ServiceConfig};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Ready,
    Disposed,
}

/// Turns URLs into preview image bytes.
///
/// # Examples
///
/// ```rust,no_run
/// use link_preview::{ScreenshotGenerator, ServiceConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let generator = ScreenshotGenerator::launch(&ServiceConfig::default()).await?;
///     let image = generator.generate("https://example.com").await;
///     println!("Captured {} bytes", image.len());
///
///     generator.dispose().await?;
///     Ok(())
/// }
/// ```
pub struct ScreenshotGenerator {
    backend: Arc<dyn CaptureBackend>,
    format: ImageFormat,
    // generate() holds a read guard for the whole capture, so dispose() waits for in-flight work
    state: RwLock<GeneratorState>,
}

impl ScreenshotGenerator {
    /// Launches a Chromium backend configured from `config`.
    pub async fn launch(config: &ServiceConfig) -> Result<Self, LinkPreviewError> {
        debug!("Launching screenshot generator");
        let backend = ChromiumBackend::launch(config).await?;
        info!("Screenshot generator ready");
        Ok(Self::with_backend(Arc::new(backend), config.preview_image_format))
    }

    pub fn with_backend(backend: Arc<dyn CaptureBackend>, format: ImageFormat) -> Self {
        Self {
            backend,
            format,
            state: RwLock::new(GeneratorState::Ready),
        }
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub async fn state(&self) -> GeneratorState {
        *self.state.read().await
    }

    /// Captures `url` in the configured format.
    ///
    /// Never fails: any navigation or capture error is logged and reported
    /// as an empty buffer, which callers treat as "no preview".
    pub async fn generate(&self, url: &str) -> Vec<u8> {
        let state = self.state.read().await;
        if *state == GeneratorState::Disposed {
            warn!("Skipping {}: {}", url, LinkPreviewError::GeneratorDisposed);
            return Vec::new();
        }

        match self.backend.capture(url, self.format).await {
            Ok(data) => {
                debug!("Captured {} bytes for {}", data.len(), url);
                data
            }
            Err(e) => {
                error!("Crashed while trying to generate the screenshot of {}: {}", url, e);
                Vec::new()
            }
        }
    }

    /// Closes the backend. Calling it again is a no-op.
    pub async fn dispose(&self) -> Result<(), LinkPreviewError> {
        let mut state = self.state.write().await;
        if *state == GeneratorState::Disposed {
            debug!("Screenshot generator already disposed");
            return Ok(());
        }

        *state = GeneratorState::Disposed;
        self.backend.close().await
    }
}
