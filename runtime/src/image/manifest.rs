//! Registry manifest and image config documents.

use std::collections::HashMap;

use a3s_ctr_core::config::Platform;
use a3s_ctr_core::error::{CtrError, Result};
use serde::{Deserialize, Serialize};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// `Accept` header sent with every manifest request.
pub fn manifest_accept_header() -> String {
    [DOCKER_MANIFEST_V2, DOCKER_MANIFEST_LIST, OCI_MANIFEST, OCI_INDEX].join(", ")
}

/// Content descriptor (config blob or layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    pub digest: String,
}

impl Descriptor {
    /// Layer compression as advertised by the media type.
    pub fn is_gzip(&self) -> bool {
        self.media_type.ends_with("+gzip") || self.media_type.ends_with(".tar.gzip")
    }
}

/// Single-platform image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Sum of the compressed layer sizes.
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformSpec {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    pub digest: String,
    #[serde(default)]
    pub platform: Option<PlatformSpec>,
}

/// Multi-platform manifest list / OCI index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub manifests: Vec<PlatformManifest>,
}

impl ManifestList {
    /// Digest of the entry for `platform`, else the first entry.
    pub fn select_platform(&self, platform: &Platform) -> Result<&PlatformManifest> {
        self.manifests
            .iter()
            .find(|m| {
                m.platform.as_ref().is_some_and(|p| {
                    p.os == platform.os && p.architecture == platform.architecture
                })
            })
            .or_else(|| self.manifests.first())
            .ok_or_else(|| CtrError::ImageError("manifest list has no entries".to_string()))
    }
}

/// Manifest response, classified by media type.
#[derive(Debug, Clone)]
pub enum Manifest {
    Image(ImageManifest),
    List(ManifestList),
}

impl Manifest {
    /// Classify a manifest body. The `Content-Type` header wins; the body's
    /// own `mediaType` and the presence of `manifests` are fallbacks.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| CtrError::ImageError(format!("failed to decode manifest: {}", e)))?;

        let header_type = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
            .filter(|ct| !ct.is_empty() && ct != "application/json");
        let media_type = header_type.or_else(|| {
            value
                .get("mediaType")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });

        let is_list = match media_type.as_deref() {
            Some(DOCKER_MANIFEST_LIST) | Some(OCI_INDEX) => true,
            Some(DOCKER_MANIFEST_V2) | Some(OCI_MANIFEST) => false,
            _ => value.get("manifests").is_some(),
        };

        if is_list {
            let list = serde_json::from_value(value).map_err(|e| {
                CtrError::ImageError(format!("failed to decode manifest list: {}", e))
            })?;
            Ok(Manifest::List(list))
        } else {
            let manifest = serde_json::from_value(value)
                .map_err(|e| CtrError::ImageError(format!("failed to decode manifest: {}", e)))?;
            Ok(Manifest::Image(manifest))
        }
    }
}

/// Runtime config carried by an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ImageConfig {
    /// Config used for images imported from a plain archive.
    pub fn archive_default() -> Self {
        Self {
            env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()],
            cmd: vec!["/bin/sh".to_string()],
            entrypoint: Vec::new(),
            working_dir: "/".to_string(),
            user: "root".to_string(),
            labels: HashMap::new(),
        }
    }

    /// `KEY=VALUE` entries as a map; entries without `=` are skipped.
    pub fn env_map(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Default argv: entrypoint followed by cmd.
    pub fn default_argv(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }
}

/// The config blob as served by a registry (only the parts we use).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigBlob {
    #[serde(default)]
    pub config: Option<ConfigBlobInner>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigBlobInner {
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

impl From<ConfigBlob> for ImageConfig {
    fn from(blob: ConfigBlob) -> Self {
        let inner = blob.config.unwrap_or_default();
        ImageConfig {
            env: inner.env.unwrap_or_default(),
            cmd: inner.cmd.unwrap_or_default(),
            entrypoint: inner.entrypoint.unwrap_or_default(),
            working_dir: inner.working_dir.unwrap_or_default(),
            user: inner.user.unwrap_or_default(),
            labels: inner.labels.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[(&str, &str, &str)]) -> ManifestList {
        ManifestList {
            schema_version: 2,
            media_type: OCI_INDEX.to_string(),
            manifests: entries
                .iter()
                .map(|(digest, os, arch)| PlatformManifest {
                    media_type: OCI_MANIFEST.to_string(),
                    size: 0,
                    digest: digest.to_string(),
                    platform: Some(PlatformSpec {
                        architecture: arch.to_string(),
                        os: os.to_string(),
                        variant: None,
                    }),
                })
                .collect(),
        }
    }

    #[test]
    fn test_select_platform_prefers_match() {
        let l = list(&[
            ("sha256:arm", "linux", "arm64"),
            ("sha256:amd", "linux", "amd64"),
        ]);
        let chosen = l.select_platform(&Platform::default()).unwrap();
        assert_eq!(chosen.digest, "sha256:amd");
    }

    #[test]
    fn test_select_platform_falls_back_to_first() {
        let l = list(&[
            ("sha256:arm", "linux", "arm64"),
            ("sha256:s390", "linux", "s390x"),
        ]);
        let chosen = l.select_platform(&Platform::default()).unwrap();
        assert_eq!(chosen.digest, "sha256:arm");
    }

    #[test]
    fn test_select_platform_empty_list() {
        let l = list(&[]);
        assert!(l.select_platform(&Platform::default()).is_err());
    }

    #[test]
    fn test_select_platform_windows_amd64_not_matched() {
        let l = list(&[
            ("sha256:win", "windows", "amd64"),
            ("sha256:lin", "linux", "amd64"),
        ]);
        assert_eq!(l.select_platform(&Platform::default()).unwrap().digest, "sha256:lin");
    }

    #[test]
    fn test_parse_by_content_type() {
        let body = br#"{"schemaVersion":2,"manifests":[{"digest":"sha256:a","platform":{"os":"linux","architecture":"amd64"}}]}"#;
        match Manifest::parse(Some(DOCKER_MANIFEST_LIST), body).unwrap() {
            Manifest::List(l) => assert_eq!(l.manifests.len(), 1),
            Manifest::Image(_) => panic!("expected list"),
        }
    }

    #[test]
    fn test_parse_by_body_media_type() {
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"mediaType":"x","size":2,"digest":"sha256:c"}},"layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","size":10,"digest":"sha256:l1"}}]}}"#,
            OCI_MANIFEST
        );
        match Manifest::parse(Some("application/json"), body.as_bytes()).unwrap() {
            Manifest::Image(m) => {
                assert_eq!(m.config.digest, "sha256:c");
                assert_eq!(m.layers.len(), 1);
                assert!(m.layers[0].is_gzip());
                assert_eq!(m.total_size(), 10);
            }
            Manifest::List(_) => panic!("expected image manifest"),
        }
    }

    #[test]
    fn test_parse_index_without_media_type() {
        let body = br#"{"schemaVersion":2,"manifests":[]}"#;
        assert!(matches!(Manifest::parse(None, body).unwrap(), Manifest::List(_)));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(Manifest::parse(None, b"not json").is_err());
        assert!(Manifest::parse(Some(OCI_MANIFEST), b"{}").is_err());
    }

    #[test]
    fn test_layer_compression() {
        let layer = |mt: &str| Descriptor {
            media_type: mt.to_string(),
            size: 0,
            digest: "sha256:x".to_string(),
        };
        assert!(layer("application/vnd.docker.image.rootfs.diff.tar.gzip").is_gzip());
        assert!(layer("application/vnd.oci.image.layer.v1.tar+gzip").is_gzip());
        assert!(!layer("application/vnd.oci.image.layer.v1.tar").is_gzip());
    }

    #[test]
    fn test_accept_header_lists_all_types() {
        let accept = manifest_accept_header();
        for mt in [DOCKER_MANIFEST_V2, DOCKER_MANIFEST_LIST, OCI_MANIFEST, OCI_INDEX] {
            assert!(accept.contains(mt));
        }
    }

    #[test]
    fn test_config_blob_conversion() {
        let blob: ConfigBlob = serde_json::from_str(
            r#"{"architecture":"amd64","os":"linux","config":{"Env":["PATH=/bin","A=b=c"],"Cmd":["nginx","-g"],"Entrypoint":["/docker-entrypoint.sh"],"WorkingDir":"/srv","User":"101","Labels":{"k":"v"}}}"#,
        )
        .unwrap();
        let config = ImageConfig::from(blob);
        assert_eq!(config.working_dir, "/srv");
        assert_eq!(config.env_map()["A"], "b=c");
        assert_eq!(
            config.default_argv(),
            vec!["/docker-entrypoint.sh", "nginx", "-g"]
        );
    }

    #[test]
    fn test_config_blob_null_fields() {
        let blob: ConfigBlob =
            serde_json::from_str(r#"{"config":{"Env":null,"Cmd":null}}"#).unwrap();
        let config = ImageConfig::from(blob);
        assert!(config.env.is_empty());
        assert!(config.default_argv().is_empty());
    }

    #[test]
    fn test_archive_default_config() {
        let config = ImageConfig::archive_default();
        assert_eq!(config.cmd, vec!["/bin/sh"]);
        assert_eq!(config.working_dir, "/");
        assert_eq!(config.user, "root");
        assert!(config.env_map()["PATH"].contains("/usr/bin"));
    }
}
