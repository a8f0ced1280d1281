use crate::utils::format_bytes;
use crate::{
    router, BatchOrchestrator, BrowserSource, BuildFormat, ImageFormat, ImageOptimizer,
    LaunchPerRequest, LinkPreviewError, OutputMode, Page, PreviewRoute, ProxyConfig,
    ScreenshotGenerator, ServiceConfig, SharedBrowser, PREVIEW_ROUTE_PREFIX,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "link-preview")]
#[command(about = "Annotate outbound links and generate link preview screenshots")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Preview image format (jpg, png)")]
    pub format: Option<String>,

    #[arg(long, help = "Proxy server passed to the browser")]
    pub proxy: Option<String>,

    #[arg(long, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Maximum concurrent screenshots")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<PathBuf>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Disable all log output")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Annotate a built site and pre-generate every preview image
    Build {
        #[arg(short, long, help = "Build output directory")]
        dir: PathBuf,

        #[arg(short, long, help = "File listing page pathnames (one per line)")]
        pages: PathBuf,

        #[arg(long, help = "Build output layout (file, directory, preserve)")]
        build_format: Option<String>,

        #[arg(long, help = "Site output mode (static, server)")]
        output: Option<String>,
    },

    /// Capture a single preview image
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,
    },

    /// Serve previews on demand under /_link-preview/
    Serve {
        #[arg(short, long, default_value = "4322", help = "Server port")]
        port: u16,

        #[arg(long, help = "Bind address")]
        bind: Option<String>,

        #[arg(long, help = "Reuse one browser for every request")]
        shared_browser: bool,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Resolves the effective configuration: JSON file first, then CLI overrides.
pub async fn load_config(args: &Cli) -> Result<ServiceConfig, LinkPreviewError> {
    let mut config = match &args.config {
        Some(path) => {
            let content = fs::read_to_string(path).await.map_err(|e| {
                LinkPreviewError::Configuration(format!("{}: {}", path.display(), e))
            })?;
            ServiceConfig::from_json(&content)?
        }
        None => ServiceConfig::default(),
    };

    if let Some(format) = &args.format {
        config.preview_image_format = format.parse::<ImageFormat>()?;
    }
    if let Some(server) = &args.proxy {
        config.proxy = Some(ProxyConfig {
            server: server.clone(),
        });
    }
    if let Some(timeout) = args.timeout {
        config.navigation_timeout_secs = timeout;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent_screenshots = max_concurrent;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
    if args.quiet {
        config.log_stats = false;
    }

    if let Commands::Build {
        build_format,
        output,
        ..
    } = &args.command
    {
        if let Some(build_format) = build_format {
            config.build_format = build_format.parse::<BuildFormat>()?;
        }
        match output.as_deref() {
            Some("static") => config.output = OutputMode::Static,
            Some("server") => config.output = OutputMode::Server,
            Some(other) => {
                return Err(LinkPreviewError::Configuration(format!(
                    "unknown output mode: {other}"
                )))
            }
            None => {}
        }
    }

    config.validate()?;
    Ok(config)
}

/// Parses a pages file: one pathname per line, `#` comments and blank lines
/// ignored, a single leading `/` stripped (so `/` names the root page).
pub fn parse_pages(content: &str) -> Vec<Page> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Page::new(line.strip_prefix('/').unwrap_or(line)))
        .collect()
}

pub struct CliRunner {
    pub config: Arc<ServiceConfig>,
    shutdown: broadcast::Sender<()>,
}

impl CliRunner {
    pub fn new(config: Arc<ServiceConfig>, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, shutdown }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        let mut interrupted = self.shutdown.subscribe();

        match command {
            Commands::Build { dir, pages, .. } => {
                tokio::select! {
                    result = self.run_build(&dir, &pages) => result,
                    _ = interrupted.recv() => {
                        warn!("Build interrupted, preview generation incomplete");
                        Ok(())
                    }
                }
            }
            Commands::Capture { url, output } => {
                tokio::select! {
                    result = self.run_capture(&url, &output) => result,
                    _ = interrupted.recv() => {
                        warn!("Capture interrupted");
                        Ok(())
                    }
                }
            }
            Commands::Serve {
                port,
                bind,
                shared_browser,
            } => self.run_server(port, bind, shared_browser).await,
            Commands::Validate { config } => self.validate_config(&config).await,
        }
    }

    pub async fn run_build(&self, dir: &Path, pages_file: &Path) -> anyhow::Result<()> {
        let content = fs::read_to_string(pages_file)
            .await
            .with_context(|| format!("failed to read pages file {}", pages_file.display()))?;
        let pages = parse_pages(&content);

        info!(
            "Processing {} pages in {} ({:?} layout)",
            pages.len(),
            dir.display(),
            self.config.build_format
        );

        let report = BatchOrchestrator::new(self.config.clone())
            .run(dir, &pages)
            .await;

        if report.files_failed > 0 || report.previews_failed > 0 {
            warn!(
                "{} pages and {} previews failed, see the log above",
                report.files_failed, report.previews_failed
            );
        }

        Ok(())
    }

    pub async fn run_capture(&self, url: &str, output: &Path) -> anyhow::Result<()> {
        info!("Capturing preview of: {}", url);

        let generator = ScreenshotGenerator::launch(&self.config).await?;
        let raw = generator.generate(url).await;
        if let Err(e) = generator.dispose().await {
            warn!("Failed to dispose screenshot generator: {}", e);
        }

        let data = ImageOptimizer::new(self.config.preview_image_format)
            .optimize_async(raw)
            .await;
        if data.is_empty() {
            bail!("no preview could be generated for {url}");
        }

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(output, &data).await?;

        println!("Preview captured successfully:");
        println!("  URL: {url}");
        println!("  Output: {}", output.display());
        println!("  Format: {}", self.config.preview_image_format);
        println!("  Size: {}", format_bytes(data.len()));

        Ok(())
    }

    pub async fn run_server(
        &self,
        port: u16,
        bind: Option<String>,
        shared_browser: bool,
    ) -> anyhow::Result<()> {
        let source: Arc<dyn BrowserSource> = if shared_browser {
            Arc::new(SharedBrowser::launch(&self.config).await?)
        } else {
            Arc::new(LaunchPerRequest::new(self.config.clone()))
        };
        let route = Arc::new(PreviewRoute::new(self.config.clone(), source));

        let addr = format!("{}:{}", bind.as_deref().unwrap_or("127.0.0.1"), port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!("Serving link previews on http://{}{}", addr, PREVIEW_ROUTE_PREFIX);

        let mut shutdown = self.shutdown.subscribe();
        let served = axum::serve(listener, router(route.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;

        route.shutdown().await;
        served?;
        Ok(())
    }

    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let content = fs::read_to_string(config_path).await?;
        let config = ServiceConfig::from_json(&content)?;

        println!("Configuration is valid:");
        println!("  Preview format: {}", config.preview_image_format);
        println!("  Output: {:?}", config.output);
        println!("  Build format: {:?}", config.build_format);
        println!(
            "  Proxy: {}",
            config
                .proxy
                .as_ref()
                .map(|p| p.server.as_str())
                .unwrap_or("none")
        );
        println!("  Navigation timeout: {:?}", config.navigation_timeout());
        println!("  Max concurrent screenshots: {}", config.max_concurrent_screenshots);

        Ok(())
    }
}

/// Installs the fmt subscriber. With `log_stats` off nothing is installed and
/// every log line is dropped.
pub fn setup_logging(log_stats: bool, verbose: bool) -> anyhow::Result<()> {
    if !log_stats {
        return Ok(());
    }

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("link-preview").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_pages() {
        let pages = parse_pages("# site pages\n/\n\n/about/\n  blog/post/  \n404\n");
        assert_eq!(
            pages,
            vec![Page::new(""), Page::new("about/"), Page::new("blog/post/"), Page::new("404")]
        );
    }

    #[tokio::test]
    async fn test_load_config_applies_overrides() {
        let args = cli(&[
            "--format",
            "png",
            "--proxy",
            "http://proxy.local:8080",
            "--timeout",
            "12",
            "build",
            "--dir",
            "dist",
            "--pages",
            "pages.txt",
            "--build-format",
            "file",
            "--output",
            "server",
        ]);
        let config = load_config(&args).await.unwrap();

        assert_eq!(config.preview_image_format, ImageFormat::Png);
        assert_eq!(config.proxy.unwrap().server, "http://proxy.local:8080");
        assert_eq!(config.navigation_timeout_secs, 12);
        assert_eq!(config.build_format, BuildFormat::File);
        assert_eq!(config.output, OutputMode::Server);
    }

    #[tokio::test]
    async fn test_load_config_rejects_bad_format() {
        let args = cli(&["--format", "webp", "validate", "--config", "x.json"]);
        let err = load_config(&args).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "logStats": false, "previewImageFormat": "png" }"#).unwrap();

        let args = cli(&["--config", path.to_str().unwrap(), "capture", "-u", "https://example.com", "-o", "x.png"]);
        let config = load_config(&args).await.unwrap();

        assert!(!config.log_stats);
        assert_eq!(config.preview_image_format, ImageFormat::Png);
    }

    #[test]
    fn test_serve_defaults() {
        match cli(&["serve"]).command {
            Commands::Serve {
                port,
                bind,
                shared_browser,
            } => {
                assert_eq!(port, 4322);
                assert!(bind.is_none());
                assert!(!shared_browser);
            }
            _ => panic!("expected serve command"),
        }
    }
}
