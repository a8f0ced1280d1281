use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum LinkPreviewError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid preview image format: {0}")]
    InvalidImageFormat(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Failed to goto url: {url} ({reason})")]
    NavigationFailed { url: String, reason: String },

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),

    #[error("HTML rewrite error: {0}")]
    HtmlRewrite(String),

    #[error("Invalid preview path: {0}")]
    InvalidPreviewPath(String),

    #[error("Screenshot generator already disposed")]
    GeneratorDisposed,

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl LinkPreviewError {
    /// Errors that abort the whole run rather than a single file or link.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkPreviewError::Configuration(_) | LinkPreviewError::InvalidImageFormat(_)
        )
    }
}

impl From<AcquireError> for LinkPreviewError {
    fn from(err: AcquireError) -> Self {
        LinkPreviewError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for LinkPreviewError {
    fn from(err: std::io::Error) -> Self {
        LinkPreviewError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LinkPreviewError {
    fn from(err: serde_json::Error) -> Self {
        LinkPreviewError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for LinkPreviewError {
    fn from(err: image::ImageError) -> Self {
        LinkPreviewError::ImageProcessing(err.to_string())
    }
}
