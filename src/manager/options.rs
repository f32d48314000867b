//! Request option bitset and its downloader mapping.

use crate::downloader::DownloaderFlags;
use std::ops::{BitOr, BitOrAssign};

/// Per-request options accepted by the manager. Flags are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFlags(u32);

impl RequestFlags {
    /// Downgrade the download's scheduling class.
    pub const LOW_PRIORITY: Self = Self(1);
    /// Enable incremental decoding; forced off when refreshing a cached
    /// image.
    pub const PROGRESSIVE_DOWNLOAD: Self = Self(1 << 1);
    /// On a cache hit, still dispatch a download so the HTTP layer can
    /// refresh its own cache; the cached image is delivered first.
    pub const REFRESH_CACHED: Self = Self(1 << 2);
    /// Continue the transfer across application background transitions.
    pub const CONTINUE_IN_BACKGROUND: Self = Self(1 << 3);
    /// Downloader participates in the cookie store.
    pub const HANDLE_COOKIES: Self = Self(1 << 4);
    /// Downloader may ignore TLS chain errors.
    pub const ALLOW_INVALID_SSL: Self = Self(1 << 5);
    /// Upgrade the download's scheduling class.
    pub const HIGH_PRIORITY: Self = Self(1 << 6);
    /// Ignore the failed-URL set for this request.
    pub const RETRY_FAILED: Self = Self(1 << 7);
    /// Do not persist to the disk tier on success.
    pub const CACHE_MEMORY_ONLY: Self = Self(1 << 8);
    /// Permit the transform delegate to run on animated images.
    pub const TRANSFORM_ANIMATED_IMAGE: Self = Self(1 << 9);
    /// The completion, not the binding layer, applies the result to the
    /// target view.
    pub const AVOID_AUTO_SET_IMAGE: Self = Self(1 << 10);
    /// Withhold the placeholder until the download has failed.
    pub const DELAY_PLACEHOLDER: Self = Self(1 << 11);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Whether no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Map to downloader flags one-for-one.
    ///
    /// When the request is refreshing an image that was found in cache,
    /// progressive decoding is forced off and the downloader is told to
    /// bypass its cached response body.
    pub fn downloader_flags(self, refreshing_hit: bool) -> DownloaderFlags {
        let mut flags = DownloaderFlags::empty();

        if self.contains(Self::LOW_PRIORITY) {
            flags |= DownloaderFlags::LOW_PRIORITY;
        }
        if self.contains(Self::PROGRESSIVE_DOWNLOAD) {
            flags |= DownloaderFlags::PROGRESSIVE;
        }
        if self.contains(Self::CONTINUE_IN_BACKGROUND) {
            flags |= DownloaderFlags::CONTINUE_IN_BACKGROUND;
        }
        if self.contains(Self::HANDLE_COOKIES) {
            flags |= DownloaderFlags::HANDLE_COOKIES;
        }
        if self.contains(Self::ALLOW_INVALID_SSL) {
            flags |= DownloaderFlags::ALLOW_INVALID_SSL;
        }
        if self.contains(Self::HIGH_PRIORITY) {
            flags |= DownloaderFlags::HIGH_PRIORITY;
        }

        if refreshing_hit {
            flags.remove(DownloaderFlags::PROGRESSIVE);
            flags.insert(DownloaderFlags::IGNORE_CACHED_RESPONSE);
        }

        flags
    }
}

impl BitOr for RequestFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RequestFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// View-layer placeholder rule: show the placeholder unless delaying is
/// requested, in which case show it only once the download finished
/// without producing an image.
pub fn should_show_placeholder(flags: RequestFlags, finished_without_image: bool) -> bool {
    !flags.contains(RequestFlags::DELAY_PLACEHOLDER) || finished_without_image
}
