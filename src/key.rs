//! Cache key and filename derivation.
//!
//! A cache key is the canonical string form of an image URL, unless the
//! application installs a key filter (for example to strip volatile query
//! parameters). On-disk filenames are a fixed-length hex digest of the key,
//! which sidesteps filesystem length limits, with the URL's file extension
//! preserved to aid out-of-band inspection and format sniffing fallbacks.

use md5::{Digest, Md5};
use std::fmt::Write as _;
use url::Url;

/// Application hook that maps a URL to a cache key.
///
/// When installed on the manager, the filter's output replaces the URL's
/// canonical string as the cache key for every request.
pub type KeyFilter = dyn Fn(&Url) -> String + Send + Sync;

/// Derive the cache key for a URL when no filter is configured.
///
/// The key is the URL's canonical string form; equality is exact string
/// equality.
pub fn key_for_url(url: &Url) -> String {
    url.as_str().to_string()
}

/// Derive the on-disk filename for a cache key.
///
/// The filename is the 32-character lowercase hex MD5 digest of the key's
/// UTF-8 bytes, followed by the key's path extension (including the dot)
/// when present and non-empty. An empty key hashes the empty byte string.
pub fn filename_for_key(key: &str) -> String {
    let digest = Md5::digest(key.as_bytes());

    let mut name = String::with_capacity(36);
    for byte in digest {
        let _ = write!(name, "{:02x}", byte);
    }

    if let Some(ext) = path_extension(key) {
        name.push('.');
        name.push_str(ext);
    }

    name
}

/// Extract the file extension from a key's URL-like path component.
///
/// Returns the substring after the last `.` of the last path segment,
/// without the dot. Query strings and fragments are ignored. A segment
/// consisting only of a leading dot (a hidden file) has no extension.
pub fn path_extension(key: &str) -> Option<&str> {
    let path = key.split(['?', '#']).next().unwrap_or(key);
    let segment = path.rsplit('/').next().unwrap_or(path);
    let dot = segment.rfind('.')?;

    if dot == 0 {
        return None;
    }

    let ext = &segment[dot + 1..];
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

/// Derive the display scale factor encoded in a key.
///
/// Keys whose last path segment's stem ends in `@2x` or `@3x` decode at
/// that scale; everything else is scale 1.
pub fn scale_for_key(key: &str) -> u32 {
    let path = key.split(['?', '#']).next().unwrap_or(key);
    let segment = path.rsplit('/').next().unwrap_or(path);
    let stem = match segment.rfind('.') {
        Some(dot) if dot > 0 => &segment[..dot],
        _ => segment,
    };

    if stem.ends_with("@3x") {
        3
    } else if stem.ends_with("@2x") {
        2
    } else {
        1
    }
}
