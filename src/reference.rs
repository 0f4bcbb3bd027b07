use std::fmt::Display;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::Error;

/// Scheme prefix naming an OCI layout directory reference,
///
const OCIDIR_PREFIX: &str = "ocidir://";

/// Tag assumed when a reference carries neither tag nor digest,
///
pub const DEFAULT_TAG: &str = "latest";

/// Backing store a reference resolves against,
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefScheme {
    /// A remote registry speaking the distribution API
    Registry,
    /// A local OCI image layout directory
    OciDir,
}

impl RefScheme {
    /// Returns the scheme name used in reference strings and dispatch,
    ///
    pub fn as_str(&self) -> &'static str {
        match self {
            RefScheme::Registry => "reg",
            RefScheme::OciDir => "ocidir",
        }
    }
}

/// A parsed reference to one artifact,
///
/// Registry form: `[<host>[:<port>]/]<repo>[:<tag>][@<algo>:<hex>]`.
/// Layout form: `ocidir://<path>[:<tag>][@<algo>:<hex>]`.
///
/// When a reference carries both a tag and a digest they name the same
/// object, the digest wins for content identity.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    scheme: RefScheme,
    registry: String,
    repository: String,
    path: String,
    tag: String,
    digest: String,
}

impl Reference {
    /// Parses a reference string,
    ///
    pub fn parse(s: impl AsRef<str>) -> Result<Self, Error> {
        let s = s.as_ref();
        if s.is_empty() {
            return Err(Error::invalid_reference("empty reference"));
        }

        if let Some(rest) = s.strip_prefix(OCIDIR_PREFIX) {
            return Self::parse_ocidir(rest);
        }

        let (rest, digest) = split_digest(s)?;
        let (rest, tag) = split_tag(rest)?;

        let (registry, repository) = match rest.split_once('/') {
            Some((first, remainder)) if is_host(first) => {
                (first.to_ascii_lowercase(), remainder.to_string())
            }
            _ => (String::new(), rest.to_string()),
        };

        if repository.is_empty() {
            return Err(Error::invalid_reference(format!("empty repository in {s}")));
        }
        validate_repository(&repository)?;

        let tag = match (tag.is_empty(), digest.is_empty()) {
            (true, true) => DEFAULT_TAG.to_string(),
            _ => tag,
        };

        Ok(Reference {
            scheme: RefScheme::Registry,
            registry,
            repository,
            path: String::new(),
            tag,
            digest,
        })
    }

    fn parse_ocidir(rest: &str) -> Result<Self, Error> {
        let (rest, digest) = split_digest(rest)?;
        // a tag separator never follows a path separator in the layout form,
        // so the rightmost colon after the final slash is the tag
        let (path, tag) = match rest.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path, tag.to_string()),
            _ => (rest, String::new()),
        };

        if path.is_empty() {
            return Err(Error::invalid_reference("empty layout path"));
        }

        let tag = match (tag.is_empty(), digest.is_empty()) {
            (true, true) => DEFAULT_TAG.to_string(),
            _ => tag,
        };

        Ok(Reference {
            scheme: RefScheme::OciDir,
            registry: String::new(),
            repository: String::new(),
            path: path.to_string(),
            tag,
            digest,
        })
    }

    /// Returns the backing scheme this reference routes to,
    ///
    pub fn scheme(&self) -> RefScheme {
        self.scheme
    }

    /// Returns the registry host, empty when defaulted or for layouts,
    ///
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Returns the repository path within the registry,
    ///
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Returns the layout directory path, empty for registry references,
    ///
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the tag, may be empty when a digest is present,
    ///
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the digest string, empty when the reference is by tag only,
    ///
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Returns a copy of this reference with the digest replaced,
    ///
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        let mut r = self.clone();
        r.digest = digest.into();
        r
    }

    /// Returns a copy of this reference with the tag replaced and digest cleared,
    ///
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        let mut r = self.clone();
        r.tag = tag.into();
        r.digest = String::new();
        r
    }

    /// The identifier used on manifest endpoints, digest wins over tag,
    ///
    pub fn tag_or_digest(&self) -> Result<&str, Error> {
        if !self.digest.is_empty() {
            Ok(&self.digest)
        } else if !self.tag.is_empty() {
            Ok(&self.tag)
        } else {
            Err(Error::new(crate::error::ErrorKind::MissingTagOrDigest))
        }
    }

    /// Re-renders the canonical reference string,
    ///
    pub fn common_name(&self) -> String {
        let mut out = String::new();
        match self.scheme {
            RefScheme::Registry => {
                if !self.registry.is_empty() {
                    out.push_str(&self.registry);
                    out.push('/');
                }
                out.push_str(&self.repository);
            }
            RefScheme::OciDir => {
                out.push_str(OCIDIR_PREFIX);
                out.push_str(&self.path);
            }
        }
        if !self.tag.is_empty() {
            out.push(':');
            out.push_str(&self.tag);
        }
        if !self.digest.is_empty() {
            out.push('@');
            out.push_str(&self.digest);
        }
        out
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.common_name())
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

fn split_digest(s: &str) -> Result<(&str, String), Error> {
    match s.split_once('@') {
        Some((rest, digest)) => {
            Digest::parse(digest)
                .map_err(|e| Error::invalid_reference(format!("bad digest in {s}")).with_source(e))?;
            Ok((rest, digest.to_string()))
        }
        None => Ok((s, String::new())),
    }
}

fn split_tag(s: &str) -> Result<(&str, String), Error> {
    // only a colon after the last slash separates a tag, otherwise it is a port
    let after_slash = s.rsplit_once('/').map(|(_, last)| last).unwrap_or(s);
    match after_slash.rsplit_once(':') {
        Some((_, tag)) => {
            if tag.is_empty() {
                return Err(Error::invalid_reference(format!("empty tag in {s}")));
            }
            validate_tag(tag)?;
            Ok((&s[..s.len() - tag.len() - 1], tag.to_string()))
        }
        None => Ok((s, String::new())),
    }
}

/// A leftmost segment is a host when it contains `.`, `:`, or is `localhost`,
///
fn is_host(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

fn validate_repository(repository: &str) -> Result<(), Error> {
    for component in repository.split('/') {
        if component.is_empty() {
            return Err(Error::invalid_reference(format!(
                "empty path component in {repository}"
            )));
        }
        let ok = component
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
            && component.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !ok {
            return Err(Error::invalid_reference(format!(
                "illegal characters in repository component {component}"
            )));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), Error> {
    let ok = tag.len() <= 128
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_');
    if !ok {
        return Err(Error::invalid_reference(format!("illegal tag {tag}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const DIGEST: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_parse_forms() {
        let r = Reference::parse("registry.example.com/proj/repo").expect("should parse");
        assert_eq!(r.registry(), "registry.example.com");
        assert_eq!(r.repository(), "proj/repo");
        assert_eq!(r.tag(), "latest");
        assert_eq!(r.digest(), "");

        let r = Reference::parse("localhost:5000/repo:v1").expect("should parse");
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.tag(), "v1");

        let r = Reference::parse(format!("registry.example.com/repo@{DIGEST}"))
            .expect("should parse");
        assert_eq!(r.tag(), "", "digest-only refs must not default the tag");
        assert_eq!(r.digest(), DIGEST);

        let r = Reference::parse(format!("registry.example.com/repo:v1@{DIGEST}"))
            .expect("should parse");
        assert_eq!(r.tag(), "v1");
        assert_eq!(r.digest(), DIGEST);

        // bare path, registry defaulted
        let r = Reference::parse("library/alpine:3").expect("should parse");
        assert_eq!(r.registry(), "");
        assert_eq!(r.repository(), "library/alpine");
        assert_eq!(r.tag(), "3");
    }

    #[test]
    fn test_host_heuristic() {
        // no dot, colon, or localhost: the first segment is part of the repository
        let r = Reference::parse("proj/repo:v1").expect("should parse");
        assert_eq!(r.registry(), "");
        assert_eq!(r.repository(), "proj/repo");

        let r = Reference::parse("localhost/repo").expect("should parse");
        assert_eq!(r.registry(), "localhost");

        let r = Reference::parse("Registry.Example.COM/repo").expect("should parse");
        assert_eq!(r.registry(), "registry.example.com", "host is lowercased");
    }

    #[test]
    fn test_parse_ocidir() {
        let r = Reference::parse("ocidir:///tmp/layout:v1").expect("should parse");
        assert_eq!(r.scheme(), RefScheme::OciDir);
        assert_eq!(r.path(), "/tmp/layout");
        assert_eq!(r.tag(), "v1");

        let r = Reference::parse("ocidir://layout").expect("should parse");
        assert_eq!(r.tag(), "latest");

        let r = Reference::parse(format!("ocidir://layout@{DIGEST}")).expect("should parse");
        assert_eq!(r.tag(), "");
        assert_eq!(r.digest(), DIGEST);
    }

    #[test]
    fn test_parse_rejects() {
        for bad in [
            "",
            "registry.example.com/",
            "registry.example.com/repo:",
            "registry.example.com/Repo",
            "registry.example.com/repo@sha256:short",
            "registry.example.com/re..po/-bad",
            "ocidir://",
        ] {
            let err = Reference::parse(bad).expect_err(bad);
            assert!(err.is(ErrorKind::InvalidReference), "{bad}: {err}");
        }
    }

    #[test]
    fn test_common_name_roundtrip() {
        for s in [
            "registry.example.com/proj/repo:latest",
            "localhost:5000/repo:v1",
            "ocidir://layout:v1",
        ] {
            assert_eq!(Reference::parse(s).expect(s).common_name(), s);
        }
        let s = format!("registry.example.com/repo:v1@{DIGEST}");
        assert_eq!(Reference::parse(&s).expect("should parse").common_name(), s);
    }

    #[test]
    fn test_tag_or_digest() {
        let r = Reference::parse(format!("registry.example.com/repo:v1@{DIGEST}"))
            .expect("should parse");
        assert_eq!(r.tag_or_digest().expect("should resolve"), DIGEST);
    }
}
