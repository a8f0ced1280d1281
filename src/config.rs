//! Configuration management with serde serialization/deserialization
//!
//! [`ServiceConfig`] is resolved once at startup (JSON file, then CLI
//! overrides), validated, and then shared read-only with every component
//! through an `Arc`. Nothing mutates it after construction.

use crate::LinkPreviewError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Process-wide settings for rewriting, screenshot generation and the preview route.
///
/// Keys use the same camelCase names as the integration options they mirror.
///
/// # Examples
///
/// ```rust
/// use link_preview::{ImageFormat, ServiceConfig};
///
/// let config = ServiceConfig::from_json(r#"{ "previewImageFormat": "png" }"#).unwrap();
/// assert_eq!(config.preview_image_format, ImageFormat::Png);
/// assert!(config.log_stats);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Enables log output (default: true)
    pub log_stats: bool,

    /// Proxy forwarded to the browser backend (default: none)
    pub proxy: Option<ProxyConfig>,

    /// Encoding of generated preview images (default: jpg)
    pub preview_image_format: ImageFormat,

    /// Forwarded to the client-side script; the core never reads it
    pub enable_on_mobile: bool,

    /// Whether the site is pre-rendered or served on request (default: static)
    pub output: OutputMode,

    /// On-disk layout of the built pages (default: directory)
    pub build_format: BuildFormat,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<PathBuf>,

    /// Browser window used for screenshots
    pub viewport: Viewport,

    /// Upper bound on a single navigation, in seconds (default: 30)
    #[serde(rename = "navigationTimeout")]
    pub navigation_timeout_secs: u64,

    /// Maximum number of link screenshots in flight during a batch
    pub max_concurrent_screenshots: usize,

    /// Maximum number of HTML files rewritten at the same time
    pub max_concurrent_rewrites: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_stats: true,
            proxy: None,
            preview_image_format: ImageFormat::Jpg,
            enable_on_mobile: false,
            output: OutputMode::Static,
            build_format: BuildFormat::Directory,
            chrome_path: None,
            viewport: Viewport::default(),
            navigation_timeout_secs: 30,
            max_concurrent_screenshots: num_cpus::get().max(1) * 2,
            max_concurrent_rewrites: 64,
        }
    }
}

impl ServiceConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(content: &str) -> Result<Self, LinkPreviewError> {
        let config: ServiceConfig = serde_json::from_str(content)
            .map_err(|e| LinkPreviewError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), LinkPreviewError> {
        if self.max_concurrent_screenshots == 0 {
            return Err(LinkPreviewError::Configuration(
                "maxConcurrentScreenshots must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_rewrites == 0 {
            return Err(LinkPreviewError::Configuration(
                "maxConcurrentRewrites must be greater than 0".to_string(),
            ));
        }

        if self.navigation_timeout_secs == 0 {
            return Err(LinkPreviewError::Configuration(
                "navigationTimeout must be greater than 0".to_string(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(LinkPreviewError::Configuration(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if let Some(proxy) = &self.proxy {
            if proxy.server.trim().is_empty() {
                return Err(LinkPreviewError::Configuration(
                    "proxy.server must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub server: String,
}

/// Encoding used for preview images, on disk and over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageFormat {
    /// JPEG at quality 75
    #[default]
    Jpg,
    /// Lossless PNG
    Png,
}

impl ImageFormat {
    /// File extension used for generated preview files.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = LinkPreviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jpg" => Ok(ImageFormat::Jpg),
            "png" => Ok(ImageFormat::Png),
            other => Err(LinkPreviewError::InvalidImageFormat(other.to_string())),
        }
    }
}

impl TryFrom<String> for ImageFormat {
    type Error = LinkPreviewError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageFormat> for String {
    fn from(format: ImageFormat) -> Self {
        format.extension().to_string()
    }
}

/// Rendering mode of the surrounding site.
///
/// `Server` sites get previews from the on-demand route and skip the
/// post-build batch entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Static,
    Server,
}

/// Layout of built HTML pages on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildFormat {
    /// `about.html`
    File,
    /// `about/index.html`
    #[default]
    Directory,
    /// Treated as `File`
    Preserve,
}

impl FromStr for BuildFormat {
    type Err = LinkPreviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(BuildFormat::File),
            "directory" => Ok(BuildFormat::Directory),
            "preserve" => Ok(BuildFormat::Preserve),
            other => Err(LinkPreviewError::Configuration(format!(
                "unknown build format: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// Chrome command-line arguments for a headless screenshot browser.
///
/// The profile directory is not part of the arguments; it is passed to
/// [`create_browser_config`] by the backend that owns it.
pub fn get_chrome_args(config: &ServiceConfig) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-process-singleton-dialog".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
    ];

    if let Some(proxy) = &config.proxy {
        args.push(format!("--proxy-server={}", proxy.server));
    }

    args
}

pub fn create_browser_config(
    config: &ServiceConfig,
    user_data_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, LinkPreviewError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .user_data_dir(user_data_dir)
        .args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(LinkPreviewError::BrowserLaunchFailed)
}
