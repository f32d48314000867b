//! Downloader interface consumed by the manager.
//!
//! The HTTP machinery itself lives outside this crate; the manager only
//! needs a cancellable download per URL with progress and completion
//! callbacks. With progressive decoding enabled the completion may fire
//! repeatedly; the last invocation carries `finished = true`.

use crate::decoded::CachedImage;
use crate::operation::Operation;
use bytes::Bytes;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Option bitset handed to a downloader, mapped one-for-one from the
/// manager's request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloaderFlags(u32);

impl DownloaderFlags {
    /// Downgrade the download's scheduling class.
    pub const LOW_PRIORITY: Self = Self(1);
    /// Decode incrementally and invoke the completion repeatedly.
    pub const PROGRESSIVE: Self = Self(1 << 1);
    /// Continue the transfer across application background transitions.
    pub const CONTINUE_IN_BACKGROUND: Self = Self(1 << 2);
    /// Participate in the cookie store.
    pub const HANDLE_COOKIES: Self = Self(1 << 3);
    /// Ignore TLS chain errors.
    pub const ALLOW_INVALID_SSL: Self = Self(1 << 4);
    /// Upgrade the download's scheduling class.
    pub const HIGH_PRIORITY: Self = Self(1 << 5);
    /// Bypass the HTTP layer's cached response body.
    pub const IGNORE_CACHED_RESPONSE: Self = Self(1 << 6);

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
}

impl BitOr for DownloaderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DownloaderFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Downloader failure, classified for blacklisting.
///
/// Transient conditions (connectivity, cancellation, timeouts, host
/// resolution) never blacklist a URL; everything else does.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("not connected to the internet")]
    NotConnected,
    #[error("download cancelled")]
    Cancelled,
    #[error("request timed out")]
    TimedOut,
    #[error("international roaming is off")]
    RoamingOff,
    #[error("cellular data not allowed")]
    DataNotAllowed,
    #[error("cannot find host")]
    CannotFindHost,
    #[error("cannot connect to host")]
    CannotConnectToHost,
    #[error("server returned status {0}")]
    BadStatus(u16),
    #[error("response was not a decodable image")]
    InvalidImageData,
    #[error("{0}")]
    Other(String),
}

impl DownloadError {
    /// Whether this failure should leave the URL eligible for retry
    /// without the retry-failed option.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::Cancelled
                | Self::TimedOut
                | Self::RoamingOff
                | Self::DataNotAllowed
                | Self::CannotFindHost
                | Self::CannotConnectToHost
        )
    }
}

/// One completion callback invocation.
#[derive(Debug, Clone, Default)]
pub struct DownloadEvent {
    /// Decoded image, when the downloader produced one.
    pub image: Option<CachedImage>,
    /// Raw encoded bytes as received.
    pub data: Option<Bytes>,
    /// Terminal error; mutually exclusive with a finished image.
    pub error: Option<DownloadError>,
    /// False only for intermediate progressive invocations.
    pub finished: bool,
}

/// Byte-level progress: `(received, expected)`; `expected` is `None` when
/// the transfer length is unknown.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Completion callback; invoked repeatedly under progressive decoding.
pub type DownloadCompletion = Box<dyn FnMut(DownloadEvent) + Send>;

/// A source of raw bytes plus decoded images for URLs.
pub trait ImageDownloader: Send + Sync {
    /// Start a download. The returned operation cancels it; cancellation
    /// is idempotent and suppresses all further callbacks.
    fn download(
        &self,
        url: &Url,
        flags: DownloaderFlags,
        progress: Option<ProgressCallback>,
        completion: DownloadCompletion,
    ) -> Arc<dyn Operation>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_empty() {
        let flags = DownloaderFlags::empty();
        assert!(flags.is_empty());
        assert!(!flags.contains(DownloaderFlags::PROGRESSIVE));
    }

    #[test]
    fn test_flags_bitor() {
        let flags = DownloaderFlags::LOW_PRIORITY | DownloaderFlags::HANDLE_COOKIES;
        assert!(flags.contains(DownloaderFlags::LOW_PRIORITY));
        assert!(flags.contains(DownloaderFlags::HANDLE_COOKIES));
        assert!(!flags.contains(DownloaderFlags::HIGH_PRIORITY));
    }

    #[test]
    fn test_flags_insert_remove() {
        let mut flags = DownloaderFlags::empty();
        flags.insert(DownloaderFlags::PROGRESSIVE);
        assert!(flags.contains(DownloaderFlags::PROGRESSIVE));

        flags.remove(DownloaderFlags::PROGRESSIVE);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_transient_errors_do_not_blacklist() {
        assert!(DownloadError::NotConnected.is_transient());
        assert!(DownloadError::Cancelled.is_transient());
        assert!(DownloadError::TimedOut.is_transient());
        assert!(DownloadError::RoamingOff.is_transient());
        assert!(DownloadError::DataNotAllowed.is_transient());
        assert!(DownloadError::CannotFindHost.is_transient());
        assert!(DownloadError::CannotConnectToHost.is_transient());
    }

    #[test]
    fn test_terminal_errors_blacklist() {
        assert!(!DownloadError::BadStatus(500).is_transient());
        assert!(!DownloadError::InvalidImageData.is_transient());
        assert!(!DownloadError::Other("boom".into()).is_transient());
    }

    #[test]
    fn test_download_event_default() {
        let event = DownloadEvent::default();
        assert!(event.image.is_none());
        assert!(event.data.is_none());
        assert!(event.error.is_none());
        assert!(!event.finished);
    }
}
