//! Image reference splitting: `[registry/]repository[:tag][@digest]`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry host, `None` for the default registry.
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest (`sha256:...`) pinned with `@`.
    pub digest: Option<String>,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid image reference: {0:?}")]
    Invalid(String),
}

impl ImageRef {
    /// Split an image reference.
    ///
    /// The first path component is a registry only when it looks like a
    /// host (contains `.` or `:`, or is `localhost`); otherwise it is part
    /// of the repository (`library/ubuntu`).
    pub fn parse(image: &str) -> Result<Self, ImageError> {
        let image = image.trim();
        if image.is_empty() || image.starts_with('/') || image.ends_with('/') {
            return Err(ImageError::Invalid(image.to_string()));
        }

        let (name, digest) = match image.split_once('@') {
            Some((_, digest)) if digest.is_empty() || !digest.contains(':') => {
                return Err(ImageError::Invalid(image.to_string()));
            }
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (image, None),
        };
        if name.is_empty() || name.ends_with('/') {
            return Err(ImageError::Invalid(image.to_string()));
        }

        let (registry, rest) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest)
            }
            _ => (None, name),
        };

        // A tag separator only counts after the last path separator.
        let name_start = rest.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match rest[name_start..].rsplit_once(':') {
            Some((_, tag)) if tag.is_empty() => {
                return Err(ImageError::Invalid(image.to_string()));
            }
            Some((_, tag)) => {
                let repo_end = rest.len() - tag.len() - 1;
                (&rest[..repo_end], Some(tag.to_string()))
            }
            None => (rest, None),
        };

        if repository.is_empty() {
            return Err(ImageError::Invalid(image.to_string()));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Repository including the registry prefix, as the engine expects it
    /// in a pull request.
    pub fn qualified_repository(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{registry}/{}", self.repository),
            None => self.repository.clone(),
        }
    }

    /// Tag, defaulting to `latest`.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// What to ask the engine for alongside the repository: the digest if
    /// pinned, else the tag.
    pub fn pull_reference(&self) -> &str {
        self.digest.as_deref().unwrap_or_else(|| self.tag_or_latest())
    }

    /// Same registry and repository, ignoring the tag.
    pub fn same_repository(&self, other: &ImageRef) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_repository() {
        let img = ImageRef::parse("ubuntu").unwrap();
        assert_eq!(img.registry, None);
        assert_eq!(img.repository, "ubuntu");
        assert_eq!(img.tag, None);
        assert_eq!(img.tag_or_latest(), "latest");
    }

    #[test]
    fn parse_namespaced_repository_is_not_a_registry() {
        let img = ImageRef::parse("library/ubuntu:22.04").unwrap();
        assert_eq!(img.registry, None);
        assert_eq!(img.repository, "library/ubuntu");
        assert_eq!(img.tag.as_deref(), Some("22.04"));
    }

    #[test]
    fn parse_private_registry_with_port() {
        let img = ImageRef::parse("registry.example.com:5000/team/web:1.4").unwrap();
        assert_eq!(img.registry.as_deref(), Some("registry.example.com:5000"));
        assert_eq!(img.repository, "team/web");
        assert_eq!(img.tag.as_deref(), Some("1.4"));
        assert_eq!(img.to_string(), "registry.example.com:5000/team/web:1.4");
    }

    #[test]
    fn parse_localhost_registry() {
        let img = ImageRef::parse("localhost/web").unwrap();
        assert_eq!(img.registry.as_deref(), Some("localhost"));
        assert_eq!(img.qualified_repository(), "localhost/web");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("web:").is_err());
        assert!(ImageRef::parse("/web").is_err());
    }

    #[test]
    fn parse_digest_reference() {
        let img = ImageRef::parse("reg.io:5000/team/web@sha256:4f6e1c").unwrap();
        assert_eq!(img.registry.as_deref(), Some("reg.io:5000"));
        assert_eq!(img.repository, "team/web");
        assert_eq!(img.tag, None);
        assert_eq!(img.digest.as_deref(), Some("sha256:4f6e1c"));
        assert_eq!(img.pull_reference(), "sha256:4f6e1c");
        assert_eq!(img.to_string(), "reg.io:5000/team/web@sha256:4f6e1c");

        let tagged = ImageRef::parse("web:1.2@sha256:4f6e1c").unwrap();
        assert_eq!(tagged.repository, "web");
        assert_eq!(tagged.tag.as_deref(), Some("1.2"));
        assert_eq!(tagged.digest.as_deref(), Some("sha256:4f6e1c"));

        assert!(ImageRef::parse("web@").is_err());
        assert!(ImageRef::parse("@sha256:4f6e1c").is_err());
    }

    #[test]
    fn same_repository_ignores_tag() {
        let a = ImageRef::parse("reg.io/web:1").unwrap();
        let b = ImageRef::parse("reg.io/web:2").unwrap();
        let c = ImageRef::parse("other.io/web:1").unwrap();
        assert!(a.same_repository(&b));
        assert!(!a.same_repository(&c));
    }
}
