//! Pinned environment references
//!
//! A reference selects exactly one environment image. Accepted forms:
//!
//! - `name:tag`
//! - `name@sha256:<64 hex chars>`
//! - `name:tag@sha256:<64 hex chars>`
//!
//! A bare `name` is rejected: there is no implicit `latest`.

use crate::error::EnvError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DIGEST_PREFIX: &str = "sha256:";
const MAX_TAG_LEN: usize = 128;

/// Pinned identifier of an environment image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironmentRef {
    name: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl EnvironmentRef {
    /// Build a reference from parts, validating each one.
    pub fn new(name: &str, tag: Option<&str>, digest: Option<&str>) -> Result<Self> {
        let display = render(name, tag, digest);
        validate_name(name).map_err(|reason| invalid(&display, reason))?;
        if let Some(tag) = tag {
            validate_tag(tag).map_err(|reason| invalid(&display, reason))?;
        }
        if let Some(digest) = digest {
            validate_digest(digest).map_err(|reason| invalid(&display, reason))?;
        }
        if tag.is_none() && digest.is_none() {
            return Err(EnvError::Unpinned(display));
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.map(str::to_string),
            digest: digest.map(str::to_ascii_lowercase),
        })
    }

    /// Repository-style name, e.g. `rust` or `toolchains/rust`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Hex digest without the `sha256:` prefix.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Copy of this reference with the digest filled in.
    pub fn with_digest(&self, digest: &str) -> Result<Self> {
        Self::new(&self.name, self.tag.as_deref(), Some(digest))
    }

    /// Copy of this reference with the tag filled in.
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        Self::new(&self.name, Some(tag), self.digest.as_deref())
    }
}

impl fmt::Display for EnvironmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(
            &self.name,
            self.tag.as_deref(),
            self.digest.as_deref(),
        ))
    }
}

impl FromStr for EnvironmentRef {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (named, digest) = match s.split_once('@') {
            Some((named, pinned)) => {
                let digest = pinned
                    .strip_prefix(DIGEST_PREFIX)
                    .ok_or_else(|| invalid(s, "digest must start with 'sha256:'"))?;
                (named, Some(digest))
            }
            None => (s, None),
        };

        let (name, tag) = match named.split_once(':') {
            Some((name, tag)) => (name, Some(tag)),
            None => (named, None),
        };

        Self::new(name, tag, digest)
    }
}

impl TryFrom<String> for EnvironmentRef {
    type Error = EnvError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<EnvironmentRef> for String {
    fn from(r: EnvironmentRef) -> Self {
        r.to_string()
    }
}

fn render(name: &str, tag: Option<&str>, digest: Option<&str>) -> String {
    let mut out = name.to_string();
    if let Some(tag) = tag {
        out.push(':');
        out.push_str(tag);
    }
    if let Some(digest) = digest {
        out.push('@');
        out.push_str(DIGEST_PREFIX);
        out.push_str(digest);
    }
    out
}

fn invalid(reference: &str, reason: impl Into<String>) -> EnvError {
    EnvError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

/// Names map onto registry paths, so every `/`-separated component must be
/// a plain lowercase segment.
fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    for segment in name.split('/') {
        if segment.is_empty() {
            return Err("name contains an empty path segment".to_string());
        }
        if segment.starts_with('.') {
            return Err(format!("name segment '{segment}' must not start with '.'"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        {
            return Err(format!(
                "name segment '{segment}' may only contain [a-z0-9._-]"
            ));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    if tag.is_empty() {
        return Err("tag must not be empty".to_string());
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(format!("tag exceeds {MAX_TAG_LEN} characters"));
    }
    if tag.starts_with('.') || tag.starts_with('-') {
        return Err("tag must not start with '.' or '-'".to_string());
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("tag may only contain [A-Za-z0-9._-]".to_string());
    }
    Ok(())
}

fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("digest must be 64 hex characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_name_and_tag() {
        let r: EnvironmentRef = "rust:1.75-slim".parse().unwrap();
        assert_eq!(r.name(), "rust");
        assert_eq!(r.tag(), Some("1.75-slim"));
        assert_eq!(r.digest(), None);
        assert_eq!(r.to_string(), "rust:1.75-slim");
    }

    #[test]
    fn test_parse_digest_only() {
        let r: EnvironmentRef = format!("toolchains/rust@sha256:{DIGEST}").parse().unwrap();
        assert_eq!(r.name(), "toolchains/rust");
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest(), Some(DIGEST));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let s = format!("rust:1.75@sha256:{DIGEST}");
        let r: EnvironmentRef = s.parse().unwrap();
        assert_eq!(r.tag(), Some("1.75"));
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.to_string(), s);
    }

    #[test]
    fn test_digest_is_lowercased() {
        let upper = DIGEST.to_ascii_uppercase();
        let r: EnvironmentRef = format!("rust@sha256:{upper}").parse().unwrap();
        assert_eq!(r.digest(), Some(DIGEST));
    }

    #[test]
    fn test_bare_name_is_unpinned() {
        let err = "rust".parse::<EnvironmentRef>().unwrap_err();
        assert!(matches!(err, EnvError::Unpinned(_)));
    }

    #[test]
    fn test_rejects_path_traversal() {
        assert!("../etc:1".parse::<EnvironmentRef>().is_err());
        assert!("a//b:1".parse::<EnvironmentRef>().is_err());
        assert!("rust:../x".parse::<EnvironmentRef>().is_err());
    }

    #[test]
    fn test_rejects_bad_digest() {
        assert!("rust@sha256:abc".parse::<EnvironmentRef>().is_err());
        assert!(format!("rust@md5:{DIGEST}").parse::<EnvironmentRef>().is_err());
    }

    #[test]
    fn test_rejects_uppercase_name() {
        assert!("Rust:1".parse::<EnvironmentRef>().is_err());
    }

    #[test]
    fn test_with_digest_pins_reference() {
        let r: EnvironmentRef = "rust:1.75".parse().unwrap();
        let pinned = r.with_digest(DIGEST).unwrap();
        assert_eq!(pinned.tag(), Some("1.75"));
        assert_eq!(pinned.digest(), Some(DIGEST));
    }

    #[test]
    fn test_serde_as_string() {
        let r: EnvironmentRef = "rust:1.75".parse().unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"rust:1.75\"");
        let back: EnvironmentRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
