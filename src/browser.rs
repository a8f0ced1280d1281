//! Browser backends for screenshot capture
//!
//! [`CaptureBackend`] is the seam between the preview pipeline and the
//! browser-automation engine. [`ChromiumBackend`] drives a headless Chromium
//! over the DevTools protocol; every capture runs in its own browser context
//! so cookies and storage never leak between links and a crashed page only
//! takes its own context down.
//!
//! [`BrowserSource`] decides how long a backend lives: one per request
//! ([`LaunchPerRequest`]) or one for the whole process ([`SharedBrowser`]).

use crate::{create_browser_config, ImageFormat, LinkPreviewError, ServiceConfig};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// JPEG quality used for every jpg preview.
pub const JPEG_QUALITY: i64 = 75;

/// Something that can turn a URL into raster image bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Navigates to `url`, waits for the page to settle and captures the full page.
    ///
    /// Navigation problems (including timeouts) are reported as
    /// [`LinkPreviewError::NavigationFailed`], capture problems as
    /// [`LinkPreviewError::CaptureFailed`].
    async fn capture(&self, url: &str, format: ImageFormat) -> Result<Vec<u8>, LinkPreviewError>;

    /// Terminates the underlying browser process.
    async fn close(&self) -> Result<(), LinkPreviewError>;
}

/// Chromium profile directory owned by exactly one browser.
///
/// Removed by [`ProfileDir::remove`] once the browser has exited, or on drop.
pub struct ProfileDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ProfileDir {
    pub fn create() -> Result<Self, LinkPreviewError> {
        Self::create_in(std::env::temp_dir())
    }

    pub fn create_in(parent: impl AsRef<Path>) -> Result<Self, LinkPreviewError> {
        let dir = tempfile::Builder::new()
            .prefix("link-preview-chromium-")
            .tempdir_in(parent)?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the directory; later calls are no-ops.
    pub fn remove(&mut self) -> Result<(), LinkPreviewError> {
        match self.dir.take() {
            Some(dir) => Ok(dir.close()?),
            None => Ok(()),
        }
    }
}

/// Headless Chromium driven through `chromiumoxide`.
pub struct ChromiumBackend {
    browser: Mutex<Browser>,
    handler: std::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>>>,
    profile: std::sync::Mutex<ProfileDir>,
    navigation_timeout: Duration,
}

impl ChromiumBackend {
    pub async fn launch(config: &ServiceConfig) -> Result<Self, LinkPreviewError> {
        let profile = ProfileDir::create()?;
        let browser_config = create_browser_config(config, profile.path())?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| LinkPreviewError::BrowserLaunchFailed(e.to_string()))?;

        // The handler is a Stream that must be polled for the CDP connection to make progress
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Browser handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        debug!("Browser handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        info!(
            "Browser launched{}",
            config
                .proxy
                .as_ref()
                .map(|p| format!(" (proxy {})", p.server))
                .unwrap_or_default()
        );

        Ok(Self {
            browser: Mutex::new(browser),
            handler: std::sync::Mutex::new(Some(handler_task)),
            profile: std::sync::Mutex::new(profile),
            navigation_timeout: config.navigation_timeout(),
        })
    }

    async fn open_page(&self, context_id: &BrowserContextId) -> Result<Page, LinkPreviewError> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(LinkPreviewError::CaptureFailed)?;

        let browser = self.browser.lock().await;
        browser
            .new_page(params)
            .await
            .map_err(|e| LinkPreviewError::CaptureFailed(e.to_string()))
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<(), LinkPreviewError> {
        let navigation = async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };

        match timeout(self.navigation_timeout, navigation).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkPreviewError::NavigationFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(LinkPreviewError::NavigationFailed {
                url: url.to_string(),
                reason: format!("{}", LinkPreviewError::Timeout(self.navigation_timeout)),
            }),
        }
    }

    async fn screenshot(&self, page: &Page, format: ImageFormat) -> Result<Vec<u8>, LinkPreviewError> {
        let params = match format {
            ImageFormat::Jpg => ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Jpeg)
                .quality(JPEG_QUALITY),
            ImageFormat::Png => ScreenshotParams::builder().format(CaptureScreenshotFormat::Png),
        }
        .full_page(true)
        .build();

        page.screenshot(params)
            .await
            .map_err(|e| LinkPreviewError::CaptureFailed(e.to_string()))
    }

    async fn capture_in_context(
        &self,
        context_id: &BrowserContextId,
        url: &str,
        format: ImageFormat,
    ) -> Result<Vec<u8>, LinkPreviewError> {
        let page = self.open_page(context_id).await?;

        let result = match self.navigate(&page, url).await {
            Ok(()) => self.screenshot(&page, format).await,
            Err(e) => Err(e),
        };

        let _ = page.close().await;
        result
    }
}

#[async_trait]
impl CaptureBackend for ChromiumBackend {
    async fn capture(&self, url: &str, format: ImageFormat) -> Result<Vec<u8>, LinkPreviewError> {
        let context_id = {
            let mut browser = self.browser.lock().await;
            browser
                .create_browser_context(CreateBrowserContextParams::default())
                .await
                .map_err(|e| LinkPreviewError::CaptureFailed(e.to_string()))?
        };

        let result = self.capture_in_context(&context_id, url, format).await;

        let browser = self.browser.lock().await;
        if let Err(e) = browser.dispose_browser_context(context_id).await {
            warn!("Failed to dispose browser context for {}: {}", url, e);
        }

        result
    }

    async fn close(&self) -> Result<(), LinkPreviewError> {
        let result = {
            let mut browser = self.browser.lock().await;
            let closed = browser
                .close()
                .await
                .map(|_| ())
                .map_err(|e| LinkPreviewError::BrowserLaunchFailed(e.to_string()));
            // The profile can only be removed once the process has exited
            if let Err(e) = browser.wait().await {
                warn!("Failed to wait for browser exit: {}", e);
            }
            closed
        };

        let handler = match self.handler.lock() {
            Ok(mut handler) => handler.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handler) = handler {
            handler.abort();
        }

        let removed = match self.profile.lock() {
            Ok(mut profile) => profile.remove(),
            Err(poisoned) => poisoned.into_inner().remove(),
        };
        if let Err(e) = removed {
            warn!("Failed to remove browser profile: {}", e);
        }

        info!("Browser closed");
        result
    }
}

/// Hands out browser backends to request handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserSource: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn CaptureBackend>, LinkPreviewError>;

    /// Gives back a backend obtained from [`BrowserSource::acquire`].
    async fn release(&self, backend: Arc<dyn CaptureBackend>);

    /// Closes any browser still owned by the source.
    async fn shutdown(&self) {}
}

/// Launches a fresh browser for every request and closes it afterwards.
pub struct LaunchPerRequest {
    config: Arc<ServiceConfig>,
}

impl LaunchPerRequest {
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserSource for LaunchPerRequest {
    async fn acquire(&self) -> Result<Arc<dyn CaptureBackend>, LinkPreviewError> {
        let backend = ChromiumBackend::launch(&self.config).await?;
        Ok(Arc::new(backend))
    }

    async fn release(&self, backend: Arc<dyn CaptureBackend>) {
        if let Err(e) = backend.close().await {
            warn!("Failed to close per-request browser: {}", e);
        }
    }
}

/// One long-lived browser shared by every request.
pub struct SharedBrowser {
    backend: Arc<dyn CaptureBackend>,
    closed: AtomicBool,
}

impl SharedBrowser {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn launch(config: &ServiceConfig) -> Result<Self, LinkPreviewError> {
        let backend = ChromiumBackend::launch(config).await?;
        Ok(Self::new(Arc::new(backend)))
    }
}

#[async_trait]
impl BrowserSource for SharedBrowser {
    async fn acquire(&self) -> Result<Arc<dyn CaptureBackend>, LinkPreviewError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkPreviewError::BrowserLaunchFailed(
                "shared browser already closed".to_string(),
            ));
        }
        Ok(self.backend.clone())
    }

    async fn release(&self, _backend: Arc<dyn CaptureBackend>) {}

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.backend.close().await {
            warn!("Failed to close shared browser: {}", e);
        }
    }
}
