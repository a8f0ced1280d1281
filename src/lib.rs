//! # Link Preview
//!
//! Link preview generation for statically built and server-rendered sites.
//! Every outbound `<a href>` in the built HTML is annotated with a stable
//! `data-link-preview` identity, and a screenshot of each link target is
//! produced either ahead of time (one image per distinct link, written next
//! to the site) or on demand from the `/_link-preview/<base64 url>` route.
//!
//! ## Pipeline
//!
//! | Stage | Module | Notes |
//! |-------|--------|-------|
//! | Identity | [`identity`] | 32-bit xxHash of the raw href |
//! | Link cache | [`link_cache`] | one per build, hashes each href once |
//! | Rewrite | [`rewriter`] | streaming, untouched bytes pass through |
//! | Capture | [`browser`], [`generator`] | headless Chromium, isolated context per link |
//! | Optimize | [`optimize`] | keeps the smaller encoding |
//! | Batch | [`batch`] | concurrent rewrite, then concurrent capture |
//! | Route | [`route`] | response cache keyed by the encoded path |
//!
//! ## Quick Start
//!
//! ```rust
//! use link_preview::{rewrite_html, LinkCache, LinkIdentity};
//!
//! let cache = LinkCache::new();
//! let html = rewrite_html(r#"<a href="https://example.com">x</a>"#, &cache).unwrap();
//!
//! let id = LinkIdentity::of("https://example.com");
//! assert!(html.contains(&format!(r#"data-link-preview="{id}""#)));
//! ```
//!
//! ## CLI Usage
//!
//! ### Post-build batch
//! ```bash
//! link-preview build --dir dist --pages pages.txt
//! ```
//!
//! ### On-demand server
//! ```bash
//! link-preview --proxy http://proxy.local:3128 serve --port 4322 --shared-browser
//! ```

/// Configuration and settings
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Deterministic link identities
pub mod identity;

/// Shared href -> identity cache
pub mod link_cache;

/// Streaming HTML anchor annotation
pub mod rewriter;

/// Browser backends and browser lifecycles
pub mod browser;

/// Screenshot generator for the post-build batch
pub mod generator;

/// Preview image re-encoding
pub mod optimize;

/// Page path calculation and the post-build orchestrator
pub mod batch;

/// On-demand preview route and HTTP adapter
pub mod route;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;


pub use batch::*;
pub use browser::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use generator::*;
pub use identity::*;
pub use link_cache::*;
pub use optimize::*;
pub use rewriter::*;
pub use route::*;
pub use utils::*;
