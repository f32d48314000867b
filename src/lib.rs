//! webimage - asynchronous two-tier caching for remote web images
//!
//! This library answers a single question for client applications that
//! repeatedly display remote images identified by URL: "give me the decoded
//! image for this URL, fast, and coalesce duplicate work."
//!
//! # High-Level API
//!
//! For most use cases, the [`manager`] module provides the entry point:
//!
//! ```ignore
//! use webimage::manager::{ImageManager, RequestFlags};
//! use std::sync::Arc;
//!
//! let manager = ImageManager::builder(downloader).build();
//!
//! let operation = manager.download_image(
//!     "https://example.com/avatar.png",
//!     RequestFlags::empty(),
//!     None,
//!     Arc::new(|outcome| {
//!         if let Some(image) = &outcome.image {
//!             // display the image
//!         }
//!     }),
//! );
//!
//! // Later, if the view is recycled:
//! operation.cancel();
//! ```
//!
//! The two-tier cache ([`cache::ImageCache`]) can also be used on its own:
//! a bounded in-memory tier with cost-based eviction in front of an
//! unbounded on-disk tier with age- and size-based sweeping.

pub mod cache;
pub mod decoded;
pub mod downloader;
pub mod executor;
pub mod key;
pub mod manager;
pub mod operation;

/// Version of the webimage library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
