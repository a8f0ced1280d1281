//! Streaming anchor annotation.
//!
//! Documents are fed through `lol_html` in fixed-size chunks, so a page is
//! never materialised as a DOM and memory stays bounded by the chunk size.
//! Only `<a href>` start tags that point at a previewable URL are touched;
//! every other byte of the document passes through unchanged.

use crate::{is_previewable_url, LinkCache, LinkPreviewError};
use lol_html::{element, HtmlRewriter, Settings};
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Attribute carrying the decimal link identity.
pub const PREVIEW_ATTRIBUTE: &str = "data-link-preview";

const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    /// Anchors that received a `data-link-preview` attribute
    pub annotated: usize,
}

/// Rewrites `input` into `output`, annotating every previewable anchor.
pub fn rewrite_stream<R: Read, W: Write>(
    mut input: R,
    output: &mut W,
    cache: &LinkCache,
) -> Result<RewriteStats, LinkPreviewError> {
    let mut annotated = 0usize;
    let mut sink_error: Option<io::Error> = None;

    {
        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![element!("a[href]", |el| {
                    if let Some(raw) = el.get_attribute("href") {
                        let href = decode_attribute_entities(&raw);
                        if is_previewable_url(&href) {
                            let identity = cache.identify(&href);
                            el.set_attribute(PREVIEW_ATTRIBUTE, &identity.to_string())?;
                            annotated += 1;
                        }
                    }
                    Ok(())
                })],
                ..Settings::new()
            },
            |chunk: &[u8]| {
                if sink_error.is_none() {
                    if let Err(e) = output.write_all(chunk) {
                        sink_error = Some(e);
                    }
                }
            },
        );

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            rewriter
                .write(&buffer[..read])
                .map_err(|e| LinkPreviewError::HtmlRewrite(e.to_string()))?;
        }

        rewriter
            .end()
            .map_err(|e| LinkPreviewError::HtmlRewrite(e.to_string()))?;
    }

    if let Some(e) = sink_error {
        return Err(e.into());
    }

    Ok(RewriteStats { annotated })
}

/// In-memory variant of [`rewrite_stream`].
pub fn rewrite_html(html: &str, cache: &LinkCache) -> Result<String, LinkPreviewError> {
    let mut output = Vec::with_capacity(html.len() + 64);
    rewrite_stream(html.as_bytes(), &mut output, cache)?;
    String::from_utf8(output).map_err(|e| LinkPreviewError::HtmlRewrite(e.to_string()))
}

/// Rewrites the HTML file at `path` in place.
///
/// The rewritten document is streamed into a sibling temporary file which
/// then replaces the original, so a failure midway leaves the page untouched.
pub async fn rewrite_file(
    path: impl Into<PathBuf>,
    cache: &LinkCache,
) -> Result<RewriteStats, LinkPreviewError> {
    let path = path.into();
    let cache = cache.clone();

    tokio::task::spawn_blocking(move || rewrite_file_blocking(&path, &cache))
        .await
        .map_err(|e| LinkPreviewError::HtmlRewrite(e.to_string()))?
}

fn rewrite_file_blocking(path: &Path, cache: &LinkCache) -> Result<RewriteStats, LinkPreviewError> {
    let source = File::open(path)?;
    let permissions = source.metadata()?.permissions();
    let input = BufReader::new(source);
    let temp_path = temp_path_for(path);

    let result = (|| -> Result<RewriteStats, LinkPreviewError> {
        let mut output = BufWriter::new(File::create(&temp_path)?);
        let stats = rewrite_stream(input, &mut output, cache)?;
        output.flush()?;
        drop(output);
        std::fs::set_permissions(&temp_path, permissions)?;
        std::fs::rename(&temp_path, path)?;
        Ok(stats)
    })();

    match &result {
        Ok(stats) => debug!("Annotated {} links in {}", stats.annotated, path.display()),
        Err(_) => {
            let _ = std::fs::remove_file(&temp_path);
        }
    }

    result
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".link-preview.tmp");
    path.with_file_name(name)
}

/// Decodes character references in an attribute value.
///
/// `lol_html` hands attribute values over exactly as written in the source,
/// while the identity must be computed from the href a browser would follow.
/// NUL becomes U+FFFD as it does in the browser's parser.
fn decode_attribute_entities(raw: &str) -> Cow<'_, str> {
    match html_escape::decode_html_entities(raw) {
        Cow::Owned(decoded) if decoded.contains('\0') => {
            Cow::Owned(decoded.replace('\0', "\u{fffd}"))
        }
        decoded => decoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LinkIdentity;

    fn annotation(url: &str) -> String {
        format!(r#"{}="{}""#, PREVIEW_ATTRIBUTE, LinkIdentity::of(url))
    }

    #[test]
    fn test_annotates_valid_anchor() {
        let cache = LinkCache::new();
        let html = r#"<p><a href="https://example.com/docs">Docs</a></p>"#;
        let output = rewrite_html(html, &cache).unwrap();

        assert!(output.contains(&annotation("https://example.com/docs")));
        assert!(output.contains(">Docs</a></p>"));
        assert_eq!(cache.get("https://example.com/docs"), Some(LinkIdentity::of("https://example.com/docs")));
    }

    #[test]
    fn test_duplicate_hrefs_share_identity_and_hash_once() {
        let cache = LinkCache::new();
        let html = concat!(
            r#"<a href="https://example.com">one</a>"#,
            r#"<div><a class="x" href="https://example.com">two</a></div>"#,
        );
        let output = rewrite_html(html, &cache).unwrap();

        assert_eq!(output.matches(&annotation("https://example.com")).count(), 2);
        assert_eq!(cache.computed_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_untouched_anchors_are_byte_identical() {
        let cache = LinkCache::new();
        let html = concat!(
            "<!DOCTYPE html><html><body>",
            r#"<a name="top">no href</a>"#,
            r#"<a href="">empty</a>"#,
            r#"<a href="/relative/path">relative</a>"#,
            r#"<a href="not a url">garbage</a>"#,
            r#"<a  href='#frag'  data-x=1 >fragment</a>"#,
            r#"<a href="mailto:me@example.com">mail</a>"#,
            "</body></html>",
        );
        let output = rewrite_html(html, &cache).unwrap();

        assert_eq!(output, html);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_non_anchor_elements_ignored() {
        let cache = LinkCache::new();
        let html = r#"<link href="https://example.com/style.css"><area href="https://example.com">"#;
        assert_eq!(rewrite_html(html, &cache).unwrap(), html);
    }

    #[test]
    fn test_entities_are_decoded_before_hashing() {
        let cache = LinkCache::new();
        let html = r#"<a href="https://example.com/?a=1&amp;b=2">q</a>"#;
        let output = rewrite_html(html, &cache).unwrap();

        assert!(cache.has("https://example.com/?a=1&b=2"));
        assert!(output.contains(&annotation("https://example.com/?a=1&b=2")));
    }

    #[test]
    fn test_stream_across_chunk_boundaries() {
        let cache = LinkCache::new();
        let mut html = String::from("<html><body>");
        for i in 0..2000 {
            html.push_str(&format!(
                r#"<p>filler {i}</p><a href="https://example.com/{}">link</a>"#,
                i % 10
            ));
        }
        html.push_str("</body></html>");

        let mut output = Vec::new();
        let stats = rewrite_stream(html.as_bytes(), &mut output, &cache).unwrap();

        assert_eq!(stats.annotated, 2000);
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.computed_count(), 10);
    }

    #[test]
    fn test_decode_attribute_entities() {
        assert_eq!(decode_attribute_entities("plain"), "plain");
        assert_eq!(decode_attribute_entities("a&amp;b"), "a&b");
        assert_eq!(decode_attribute_entities("&#47;&#x2F;"), "//");
        assert_eq!(decode_attribute_entities("a&b"), "a&b");
        assert_eq!(decode_attribute_entities("a&unknown;b"), "a&unknown;b");
        assert_eq!(decode_attribute_entities("?a=1&AMP;b=2"), "?a=1&b=2");
        assert_eq!(decode_attribute_entities("https:&sol;&sol;x"), "https://x");
        assert!(!decode_attribute_entities("a&#0;b").contains('\0'));
    }

    #[test]
    fn test_named_references_hash_like_the_browser_href() {
        let cache = LinkCache::new();
        let html = r#"<a href="https:&sol;&sol;example.com/?a=1&AMP;b=2">q</a>"#;
        let output = rewrite_html(html, &cache).unwrap();

        assert!(cache.has("https://example.com/?a=1&b=2"));
        assert!(output.contains(&annotation("https://example.com/?a=1&b=2")));
    }

    #[tokio::test]
    async fn test_rewrite_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        std::fs::write(&path, r#"<a href="https://example.com">x</a>"#).unwrap();

        let cache = LinkCache::new();
        let stats = rewrite_file(&path, &cache).await.unwrap();

        assert_eq!(stats.annotated, 1);
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains(&annotation("https://example.com")));
        assert!(!temp_path_for(&path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rewrite_file_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        std::fs::write(&path, r#"<a href="https://example.com">x</a>"#).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        rewrite_file(&path, &LinkCache::new()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn test_rewrite_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LinkCache::new();
        let result = rewrite_file(dir.path().join("missing.html"), &cache).await;
        assert!(matches!(result, Err(LinkPreviewError::Io(_))));
    }
}
