//! Image reference parsing.
//!
//! Parses references like `alpine`, `nginx:1.25`, `ghcr.io/org/app:v1` or
//! `repo@sha256:...` into registry, repository, tag and digest.

use a3s_ctr_core::error::{CtrError, Result};

/// Registry name for Docker Hub references.
pub const DOCKER_HUB: &str = "docker.io";

/// Namespace for single-segment Docker Hub repositories.
const LIBRARY_PREFIX: &str = "library/";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (`docker.io`, `ghcr.io`, `localhost:5000`)
    pub registry: String,
    /// Repository path (`library/nginx`, `org/app`)
    pub repository: String,
    pub tag: Option<String>,
    /// Digest (`sha256:...`)
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myuser/app` → docker.io/myuser/app:latest
    /// - `localhost:5000/app:v1` → localhost:5000/app:v1
    /// - `ghcr.io/org/app@sha256:abc` → pinned by digest, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(CtrError::Validation("empty image reference".to_string()));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(CtrError::Validation(format!(
                "image reference '{}' contains whitespace",
                reference
            )));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') || digest.ends_with(':') {
                    return Err(CtrError::Validation(format!(
                        "invalid digest in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon can only follow the last path segment; a colon before
        // the first slash is a registry port.
        let last_segment_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if tag.as_deref() == Some("") {
            return Err(CtrError::Validation(format!(
                "empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = split_registry_repository(name, reference)?;
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn is_docker_hub(&self) -> bool {
        self.registry == DOCKER_HUB
    }

    /// The tag or digest used in `/v2/<repo>/manifests/<reference>`.
    /// A digest wins over a tag.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Short `repo:tag` form recorded in the image index.
    ///
    /// Docker Hub references drop the registry and the `library/` prefix,
    /// so `alpine`, `alpine:latest` and `docker.io/library/alpine` agree.
    pub fn repo_tag(&self) -> String {
        let repo = if self.is_docker_hub() {
            self.repository
                .strip_prefix(LIBRARY_PREFIX)
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        match (&self.tag, &self.digest) {
            (Some(tag), _) => format!("{}:{}", repo, tag),
            (None, Some(digest)) => format!("{}@{}", repo, digest),
            (None, None) => format!("{}:{}", repo, DEFAULT_TAG),
        }
    }

    /// Registry base URL. Docker Hub maps to `hub_url`; anything else is
    /// reached over HTTPS at its own host.
    pub fn registry_url(&self, hub_url: &str) -> String {
        if self.is_docker_hub() {
            hub_url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.registry)
        }
    }

    /// Fully qualified reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

fn split_registry_repository(name: &str, reference: &str) -> Result<(String, String)> {
    if name.is_empty() {
        return Err(CtrError::Validation(format!(
            "empty repository in reference '{}'",
            reference
        )));
    }

    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(CtrError::Validation(format!(
                    "empty repository in reference '{}'",
                    reference
                )));
            }
            let registry = if first == "index.docker.io" || first == "registry-1.docker.io" {
                DOCKER_HUB.to_string()
            } else {
                first.to_string()
            };
            let repository = if registry == DOCKER_HUB && !rest.contains('/') {
                format!("{}{}", LIBRARY_PREFIX, rest)
            } else {
                rest.to_string()
            };
            return Ok((registry, repository));
        }
        return Ok((DOCKER_HUB.to_string(), name.to_string()));
    }

    Ok((DOCKER_HUB.to_string(), format!("{}{}", LIBRARY_PREFIX, name)))
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = CtrError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
