//! Image reference helpers.
//!
//! Services are configured with a registry-relative reference (`name:tag`);
//! the deployed image carries the registry host as a prefix
//! (`host/name:tag`). Digests are opaque `sha256:…` strings and are only
//! ever compared for equality.

/// Strips the scheme and any trailing slash from a registry URL, leaving the
/// host (and port) used as the local image prefix.
pub fn registry_host(url: &str) -> &str {
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    host.trim_end_matches('/')
}

/// Returns the name part of a `name:tag` reference.
pub fn image_name(image: &str) -> &str {
    match image.rfind(':') {
        Some(idx) => &image[..idx],
        None => image,
    }
}

/// Returns the tag part of a `name:tag` reference, defaulting to `latest`.
pub fn image_tag(image: &str) -> &str {
    match image.rfind(':') {
        Some(idx) => &image[idx + 1..],
        None => "latest",
    }
}

/// Splits a full `registry/name:tag` reference into (`registry/name`, tag).
///
/// The tag separator is the last colon after the last slash, so registry
/// ports (`localhost:5000/app`) are not mistaken for tags.
pub fn split_image_ref(image: &str) -> (&str, &str) {
    let tag_start = match image.rfind('/') {
        Some(slash) => image[slash..].rfind(':').map(|idx| slash + idx),
        None => image.rfind(':'),
    };
    match tag_start {
        Some(idx) => (&image[..idx], &image[idx + 1..]),
        None => (image, "latest"),
    }
}

/// Shortens a digest for log lines (`sha256:` plus twelve hex characters).
pub fn short_digest(digest: &str) -> &str {
    if digest.len() > 19 {
        &digest[..19]
    } else {
        digest
    }
}
