//! Track locator handling
//!
//! Locators are absolute URIs. Local files use `file://` with a
//! percent-encoded absolute path; audio CD tracks use `cdda://<track>` with
//! an optional `#<device>` suffix naming the drive.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

pub const FILE_SCHEME: &str = "file";
pub const DISC_SCHEME: &str = "cdda";

/// Scheme of a URI, if it has a syntactically valid one
pub fn scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        Some(scheme)
    } else {
        None
    }
}

/// Validate that a locator is an absolute URI
///
/// `file` URIs must carry an absolute path (`file:///...`).
pub fn require_absolute(uri: &str) -> Result<()> {
    match scheme(uri) {
        Some(s) if s.eq_ignore_ascii_case(FILE_SCHEME) => {
            if uri[s.len() + 1..].starts_with("///") {
                Ok(())
            } else {
                Err(Error::InvalidLocator(format!(
                    "file locator without absolute path: {}",
                    uri
                )))
            }
        }
        Some(_) => Ok(()),
        None => Err(Error::InvalidLocator(format!("not an absolute URI: {}", uri))),
    }
}

/// Convert an absolute filesystem path into a `file://` URI
pub fn path_to_uri(path: &Path) -> Result<String> {
    if !path.is_absolute() {
        return Err(Error::InvalidLocator(format!(
            "relative path: {}",
            path.display()
        )));
    }
    let mut uri = String::from("file://");
    for component in path.components() {
        if let Component::Normal(part) = component {
            uri.push('/');
            uri.push_str(&urlencoding::encode(&part.to_string_lossy()));
        }
    }
    if uri.len() == "file://".len() {
        uri.push('/');
    }
    Ok(uri)
}

/// Filesystem path of a `file://` URI
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let rest = uri.strip_prefix("file://")?;
    let decoded = urlencoding::decode(rest).ok()?;
    Some(PathBuf::from(decoded.into_owned()))
}

/// Split a disc locator into the URI the decoder opens and the drive
///
/// Non-disc locators come back unchanged with no device.
pub fn split_disc_device(uri: &str) -> (&str, Option<&str>) {
    match scheme(uri) {
        Some(s) if s.eq_ignore_ascii_case(DISC_SCHEME) => match uri.rsplit_once('#') {
            Some((base, device)) if !device.is_empty() => (base, Some(device)),
            Some((base, _)) => (base, None),
            None => (uri, None),
        },
        _ => (uri, None),
    }
}
