//! Post-build batch: annotate every page, then screenshot every distinct link.

use crate::utils::{format_bytes, format_duration};
use crate::{
    rewrite_file, BuildFormat, ImageFormat, ImageOptimizer, LinkCache, LinkIdentity,
    LinkPreviewError, OutputMode, ScreenshotGenerator, ServiceConfig,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// A built page as reported by the site generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Route pathname without a leading slash (`""` for the root page)
    pub pathname: String,
}

impl Page {
    pub fn new(pathname: impl Into<String>) -> Self {
        Self {
            pathname: pathname.into(),
        }
    }
}

/// Relative HTML file paths for `pages` under the given build layout.
///
/// ```rust
/// use link_preview::{calc_page_paths, BuildFormat, Page};
///
/// let paths = calc_page_paths(&[Page::new("about/"), Page::new("404")], BuildFormat::Directory);
/// assert_eq!(paths, vec!["about/index.html", "404.html"]);
/// ```
pub fn calc_page_paths(pages: &[Page], format: BuildFormat) -> Vec<String> {
    pages
        .iter()
        .map(|page| page_path(&page.pathname, format))
        .collect()
}

fn page_path(pathname: &str, format: BuildFormat) -> String {
    let is_index = pathname.is_empty() || pathname.ends_with('/');

    match format {
        BuildFormat::Directory => {
            if pathname == "404" || pathname == "404/" {
                "404.html".to_string()
            } else if is_index {
                format!("{pathname}index.html")
            } else {
                format!("{pathname}/index.html")
            }
        }
        BuildFormat::File | BuildFormat::Preserve => {
            if is_index {
                format!("{pathname}index.html")
            } else {
                format!("{pathname}.html")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub files_rewritten: usize,
    pub files_failed: usize,
    /// Distinct links found across all pages
    pub links_discovered: usize,
    pub previews_written: usize,
    pub previews_failed: usize,
    pub elapsed: Duration,
    /// True when the build targets server output and nothing ran
    pub skipped: bool,
}

/// Completion counters shared by concurrently running tasks.
#[derive(Clone)]
pub struct ProgressTracker {
    total: usize,
    completed: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: Arc::new(AtomicUsize::new(0)),
            errors: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn record_completion(&self, success: bool) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Progress: {}/{}", completed, self.total);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> usize {
        self.completed() - self.errors()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_complete(&self) -> bool {
        self.completed() >= self.total
    }
}

/// Drives the rewrite and screenshot phases of one build.
pub struct BatchOrchestrator {
    config: Arc<ServiceConfig>,
    cache: LinkCache,
    optimizer: ImageOptimizer,
}

impl BatchOrchestrator {
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        let optimizer = ImageOptimizer::new(config.preview_image_format);
        Self {
            config,
            cache: LinkCache::new(),
            optimizer,
        }
    }

    pub fn link_cache(&self) -> &LinkCache {
        &self.cache
    }

    /// Absolute HTML paths of `pages` inside `out_dir`, each file listed once.
    ///
    /// Distinct pathnames can land on the same file (`404` and `404/`).
    pub fn html_paths(&self, out_dir: &Path, pages: &[Page]) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        calc_page_paths(pages, self.config.build_format)
            .into_iter()
            .map(|relative| out_dir.join(relative))
            .filter(|path| path.extension().map_or(false, |ext| ext == "html"))
            .filter(|path| seen.insert(path.clone()))
            .collect()
    }

    /// Runs the whole post-build phase with a freshly launched Chromium.
    pub async fn run(&self, out_dir: &Path, pages: &[Page]) -> BatchReport {
        self.run_with(out_dir, pages, |config| async move {
            ScreenshotGenerator::launch(&config).await
        })
        .await
    }

    /// Runs the post-build phase, creating the generator with `launch` once
    /// links are known.
    ///
    /// The generator is only launched when at least one link was found, and
    /// it is disposed exactly once after every link task has settled.
    pub async fn run_with<F, Fut>(&self, out_dir: &Path, pages: &[Page], launch: F) -> BatchReport
    where
        F: FnOnce(Arc<ServiceConfig>) -> Fut,
        Fut: std::future::Future<Output = Result<ScreenshotGenerator, LinkPreviewError>>,
    {
        let start = Instant::now();

        if self.config.output == OutputMode::Server {
            info!("Server output: link previews are rendered on demand, skipping batch");
            return BatchReport {
                skipped: true,
                ..Default::default()
            };
        }

        let paths = self.html_paths(out_dir, pages);
        let rewrite = self.rewrite_all(paths).await;

        let links = self.cache.snapshot();
        let mut report = BatchReport {
            files_rewritten: rewrite.successes(),
            files_failed: rewrite.errors(),
            links_discovered: links.len(),
            ..Default::default()
        };

        if links.is_empty() {
            info!("No previewable links found");
            report.elapsed = start.elapsed();
            return report;
        }

        match launch(self.config.clone()).await {
            Ok(generator) => {
                let generator = Arc::new(generator);
                let progress = self.generate_all(generator.clone(), out_dir, links).await;

                if let Err(e) = generator.dispose().await {
                    warn!("Failed to dispose screenshot generator: {}", e);
                }

                report.previews_written = progress.successes();
                report.previews_failed = progress.errors();
            }
            Err(e) => {
                error!("Failed to launch screenshot generator: {}", e);
                report.previews_failed = links.len();
            }
        }

        report.elapsed = start.elapsed();
        info!(
            "Link preview batch completed in {}. Pages: {} rewritten, {} failed. Previews: {} written, {} failed",
            format_duration(report.elapsed),
            report.files_rewritten,
            report.files_failed,
            report.previews_written,
            report.previews_failed
        );

        report
    }

    /// Rewrites every file concurrently. One failing file never stops the others.
    pub async fn rewrite_all(&self, paths: Vec<PathBuf>) -> ProgressTracker {
        let progress = ProgressTracker::new(paths.len());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_rewrites));

        info!("Rewriting links in {} HTML files", paths.len());

        let tasks: Vec<_> = paths
            .into_iter()
            .map(|path| {
                let cache = self.cache.clone();
                let semaphore = semaphore.clone();
                let progress = progress.clone();

                tokio::spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => rewrite_file(&path, &cache).await,
                        Err(e) => Err(e.into()),
                    };

                    if let Err(e) = &result {
                        error!("Crashed while trying to parse the HTML of {}: {}", path.display(), e);
                    }
                    progress.record_completion(result.is_ok());
                })
            })
            .collect();

        settle(tasks, &progress).await;
        progress
    }

    /// Generates, optimizes and writes one preview per link.
    pub async fn generate_all(
        &self,
        generator: Arc<ScreenshotGenerator>,
        out_dir: &Path,
        links: Vec<(String, LinkIdentity)>,
    ) -> ProgressTracker {
        let progress = ProgressTracker::new(links.len());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_screenshots));

        info!("Generating {} link previews", links.len());

        let tasks: Vec<_> = links
            .into_iter()
            .map(|(url, identity)| {
                let generator = generator.clone();
                let semaphore = semaphore.clone();
                let progress = progress.clone();
                let optimizer = self.optimizer;
                let out_dir = out_dir.to_path_buf();

                tokio::spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => {
                            generate_preview(&generator, optimizer, &url, identity, &out_dir).await
                        }
                        Err(e) => Err(e.into()),
                    };

                    match &result {
                        Ok((path, size)) => info!(
                            "Generated preview image for {}: {} ({})",
                            url,
                            path.display(),
                            format_bytes(*size)
                        ),
                        Err(e) => error!("Failed to generate preview image for {}: {}", url, e),
                    }
                    progress.record_completion(result.is_ok());
                })
            })
            .collect();

        settle(tasks, &progress).await;
        progress
    }
}

/// On-disk location of the preview image for `identity`.
pub fn preview_path(out_dir: &Path, identity: LinkIdentity, format: ImageFormat) -> PathBuf {
    out_dir.join(format!("{}.{}", identity, format.extension()))
}

async fn generate_preview(
    generator: &ScreenshotGenerator,
    optimizer: ImageOptimizer,
    url: &str,
    identity: LinkIdentity,
    out_dir: &Path,
) -> Result<(PathBuf, usize), LinkPreviewError> {
    let raw = generator.generate(url).await;
    let data = optimizer.optimize_async(raw).await;

    if data.is_empty() {
        return Err(LinkPreviewError::CaptureFailed(
            "screenshot came back empty".to_string(),
        ));
    }

    let path = preview_path(out_dir, identity, generator.format());
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &data).await?;

    Ok((path, data.len()))
}

async fn settle(tasks: Vec<tokio::task::JoinHandle<()>>, progress: &ProgressTracker) {
    for joined in join_all(tasks).await {
        if let Err(e) = joined {
            error!("Batch task panicked: {}", e);
            progress.record_completion(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(pathnames: &[&str], format: BuildFormat) -> Vec<String> {
        let pages: Vec<_> = pathnames.iter().map(|p| Page::new(*p)).collect();
        calc_page_paths(&pages, format)
    }

    #[test]
    fn test_directory_layout() {
        assert_eq!(
            paths(&["", "about/", "blog/post/", "404/", "404", "docs"], BuildFormat::Directory),
            vec![
                "index.html",
                "about/index.html",
                "blog/post/index.html",
                "404.html",
                "404.html",
                "docs/index.html"
            ]
        );
    }

    #[test]
    fn test_file_layout() {
        assert_eq!(
            paths(&["", "about", "blog/post", "404", "docs/"], BuildFormat::File),
            vec!["index.html", "about.html", "blog/post.html", "404.html", "docs/index.html"]
        );
    }

    #[test]
    fn test_preserve_behaves_as_file() {
        let pathnames = ["", "about", "404", "nested/"];
        assert_eq!(
            paths(&pathnames, BuildFormat::Preserve),
            paths(&pathnames, BuildFormat::File)
        );
    }

    #[test]
    fn test_html_paths_are_joined_to_out_dir() {
        let orchestrator = BatchOrchestrator::new(Arc::new(ServiceConfig::default()));
        let out = Path::new("/site/dist");
        assert_eq!(
            orchestrator.html_paths(out, &[Page::new("about/")]),
            vec![PathBuf::from("/site/dist/about/index.html")]
        );
    }

    #[test]
    fn test_html_paths_deduplicated() {
        let orchestrator = BatchOrchestrator::new(Arc::new(ServiceConfig::default()));
        let out = Path::new("/site/dist");
        let pages = [
            Page::new("404"),
            Page::new("about/"),
            Page::new("404/"),
            Page::new("about/"),
        ];
        assert_eq!(
            orchestrator.html_paths(out, &pages),
            vec![
                PathBuf::from("/site/dist/404.html"),
                PathBuf::from("/site/dist/about/index.html"),
            ]
        );
    }

    #[tokio::test]
    async fn test_pages_sharing_a_file_rewrite_it_once() {
        let orchestrator = BatchOrchestrator::new(Arc::new(ServiceConfig::default()));
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("404.html"), "<p>missing</p>").unwrap();

        let report = orchestrator
            .run_with(dir.path(), &[Page::new("404"), Page::new("404/")], |_| async {
                Err(LinkPreviewError::BrowserLaunchFailed("no links".to_string()))
            })
            .await;

        assert_eq!(report.files_rewritten, 1);
        assert_eq!(report.files_failed, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_preview_path() {
        let path = preview_path(Path::new("dist"), LinkIdentity::from_raw(123), ImageFormat::Png);
        assert_eq!(path, PathBuf::from("dist/123.png"));
    }

    #[test]
    fn test_progress_tracker() {
        let progress = ProgressTracker::new(3);
        progress.record_completion(true);
        progress.record_completion(false);
        assert!(!progress.is_complete());
        progress.record_completion(true);

        assert!(progress.is_complete());
        assert_eq!(progress.successes(), 2);
        assert_eq!(progress.errors(), 1);
    }

    #[tokio::test]
    async fn test_server_output_skips_everything() {
        let config = ServiceConfig {
            output: OutputMode::Server,
            ..Default::default()
        };
        let orchestrator = BatchOrchestrator::new(Arc::new(config));
        let dir = tempfile::tempdir().unwrap();

        let report = orchestrator
            .run_with(dir.path(), &[Page::new("")], |_| async {
                Err(LinkPreviewError::BrowserLaunchFailed("must not launch".to_string()))
            })
            .await;

        assert!(report.skipped);
        assert_eq!(report, BatchReport { skipped: true, ..Default::default() });
    }
}
