//! Version manifests.
//!
//! Toolchains are described by a two-level manifest tree served over HTTP:
//!
//! ```text
//! <base>/<namespace>/manifest.json      root manifest
//!     platform -> arch -> location of a platform manifest
//! <location>                             platform manifest
//!     latest + version -> archive spec
//! ```
//!
//! ## Root Manifest Format
//!
//! ```json
//! { "compiler": { "linux": { "x86_64": "linux/x86_64/manifest.json" } } }
//! ```
//!
//! The listing form used by older distribution servers is also accepted. It
//! describes a single namespace, the one it was fetched for:
//!
//! ```json
//! { "platforms": [ { "platform": "linux",
//!                    "architectures": [ { "arch": "x86_64", "manifest_path": "..." } ] } ] }
//! ```
//!
//! ## Platform Manifest Format
//!
//! ```json
//! {
//!   "latest": "1.2.3",
//!   "versions": {
//!     "1.2.3": { "href": "toolchain-1.2.3.tar.zst", "sha256": "..." },
//!     "1.3.0": { "href": "toolchain-1.3.0.tar.zst", "sha256": "<whole archive>",
//!                "parts": [ { "href": "...part1", "sha256": "...", "size": 1048576 } ] }
//!   }
//! }
//! ```
//!
//! Versions may also sit next to `latest` at the top level (flat layout).
//! Version entries lacking `href` or `sha256` are skipped. Relative locations
//! and hrefs resolve against the URL of the manifest that contains them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::errors::{Result, ToolchainError};
use crate::retry::RetryPolicy;
use crate::target::Target;
use crate::transport::{Transport, get_bytes};

/// File name of each namespace's root manifest.
pub const ROOT_MANIFEST_FILE: &str = "manifest.json";

/// Key of the declared latest version in a platform manifest.
const LATEST_KEY: &str = "latest";

/// Key of the nested version table in a platform manifest.
const VERSIONS_KEY: &str = "versions";

/// Root manifest: namespace -> platform -> arch -> platform manifest URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootManifest {
    entries: BTreeMap<String, BTreeMap<String, BTreeMap<String, Url>>>,
    source: Url,
}

impl RootManifest {
    /// Parses a root manifest fetched from `source` on behalf of `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::ManifestParse`] if the body is not a root
    /// manifest and [`ToolchainError::InvalidManifest`] if a location is not a
    /// valid URL reference.
    pub fn parse(bytes: &[u8], namespace: &str, source: &Url) -> Result<Self> {
        let raw: RawRootManifest =
            serde_json::from_slice(bytes).map_err(|e| parse_error(source, e))?;

        let nested = match raw {
            RawRootManifest::Listing { platforms } => {
                let mut by_platform = BTreeMap::new();
                for platform in platforms {
                    let archs: BTreeMap<String, String> = platform
                        .architectures
                        .into_iter()
                        .filter_map(|a| a.location().map(|loc| (a.arch.clone(), loc.to_string())))
                        .collect();
                    by_platform.insert(platform.platform, archs);
                }
                BTreeMap::from([(namespace.to_string(), by_platform)])
            }
            RawRootManifest::Nested(map) => map,
        };

        let mut entries = BTreeMap::new();
        for (ns, platforms) in nested {
            let mut resolved_platforms = BTreeMap::new();
            for (platform, archs) in platforms {
                let mut resolved_archs = BTreeMap::new();
                for (arch, location) in archs {
                    resolved_archs.insert(arch, join(source, &location)?);
                }
                resolved_platforms.insert(platform, resolved_archs);
            }
            entries.insert(ns, resolved_platforms);
        }

        Ok(Self {
            entries,
            source: source.clone(),
        })
    }

    /// Where this manifest was fetched from.
    #[must_use]
    pub fn source(&self) -> &Url {
        &self.source
    }

    /// Looks up the platform manifest location for a target.
    #[must_use]
    pub fn location(&self, namespace: &str, platform: &str, arch: &str) -> Option<&Url> {
        self.entries.get(namespace)?.get(platform)?.get(arch)
    }

    /// Lists `(platform, arch)` pairs available for `namespace`.
    #[must_use]
    pub fn platforms(&self, namespace: &str) -> Vec<(&str, &str)> {
        self.entries
            .get(namespace)
            .into_iter()
            .flat_map(|platforms| {
                platforms.iter().flat_map(|(platform, archs)| {
                    archs.keys().map(move |arch| (platform.as_str(), arch.as_str()))
                })
            })
            .collect()
    }
}

/// One part of a multi-part archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePart {
    /// Absolute download URL.
    pub href: Url,
    /// Expected SHA256 of this part.
    pub sha256: String,
    /// Declared length in bytes, if the manifest gives one.
    pub size: Option<u64>,
}

/// How a version's archive is delivered.
///
/// Decided once, when the manifest is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSpec {
    /// One file.
    Single {
        /// Absolute download URL.
        href: Url,
        /// Expected SHA256 of the file.
        sha256: String,
    },
    /// Several files that, concatenated in listed order, form the archive.
    MultiPart {
        /// Parts in concatenation order.
        parts: Vec<ArchivePart>,
        /// Expected SHA256 of the concatenation.
        whole_sha256: String,
    },
}

impl ArchiveSpec {
    /// SHA256 of the complete archive, whichever way it is delivered.
    #[must_use]
    pub fn sha256(&self) -> &str {
        match self {
            Self::Single { sha256, .. } => sha256,
            Self::MultiPart { whole_sha256, .. } => whole_sha256,
        }
    }
}

/// Per-platform manifest: the declared latest version and every version's
/// archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformManifest {
    /// The version `latest` resolves to.
    pub latest: String,
    /// Archives keyed by version string.
    pub versions: BTreeMap<String, ArchiveSpec>,
    source: Url,
}

impl PlatformManifest {
    /// Parses a platform manifest fetched from `source`.
    ///
    /// Accepts both the nested (`"versions": {...}`) and the flat layout.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::ManifestParse`] if the body is not a JSON
    /// object, and [`ToolchainError::InvalidManifest`] for a non-string
    /// `latest`, unusable hrefs or incomplete parts.
    pub fn parse(bytes: &[u8], source: &Url) -> Result<Self> {
        let mut object: serde_json::Map<String, Value> =
            serde_json::from_slice(bytes).map_err(|e| parse_error(source, e))?;

        let latest = match object.remove(LATEST_KEY) {
            Some(Value::String(latest)) => latest,
            Some(other) => {
                return Err(invalid(source, format!("`latest` must be a string, got {other}")));
            }
            None => String::new(),
        };

        let entries = match object.remove(VERSIONS_KEY) {
            Some(Value::Object(nested)) => nested,
            Some(other) => {
                // Not a version table; in the flat layout it could only be a
                // version literally named "versions".
                object.insert(VERSIONS_KEY.to_string(), other);
                object
            }
            None => object,
        };

        let mut versions = BTreeMap::new();
        for (version, value) in entries {
            let Ok(raw) = serde_json::from_value::<RawVersionEntry>(value) else {
                tracing::debug!(%source, %version, "skipping malformed version entry");
                continue;
            };
            let (Some(href), Some(sha256)) = (raw.href, raw.sha256) else {
                tracing::debug!(%source, %version, "skipping version entry without href/sha256");
                continue;
            };
            let spec = build_spec(source, &version, &href, sha256, raw.parts.unwrap_or_default())?;
            versions.insert(version, spec);
        }

        Ok(Self {
            latest,
            versions,
            source: source.clone(),
        })
    }

    /// Where this manifest was fetched from.
    #[must_use]
    pub fn source(&self) -> &Url {
        &self.source
    }

    /// Versions newest first, for display.
    ///
    /// Semver versions sort by precedence and come before anything that does
    /// not parse as semver; the rest sort lexicographically, descending.
    #[must_use]
    pub fn sorted_versions(&self) -> Vec<&str> {
        let mut versions: Vec<&str> = self.versions.keys().map(String::as_str).collect();
        versions.sort_by(|a, b| {
            let a_ver = semver::Version::parse(a).ok();
            let b_ver = semver::Version::parse(b).ok();
            match (a_ver, b_ver) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => b.cmp(a),
            }
        });
        versions
    }
}

/// Which version to install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VersionRequest {
    /// Whatever the platform manifest declares as `latest`.
    #[default]
    Latest,
    /// A version key exactly as it appears in the manifest.
    Exact(String),
}

impl From<&str> for VersionRequest {
    fn from(value: &str) -> Self {
        if value.eq_ignore_ascii_case(LATEST_KEY) {
            Self::Latest
        } else {
            Self::Exact(value.to_string())
        }
    }
}

impl From<Option<&str>> for VersionRequest {
    fn from(value: Option<&str>) -> Self {
        value.map_or(Self::Latest, Self::from)
    }
}

impl std::fmt::Display for VersionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => f.write_str(LATEST_KEY),
            Self::Exact(version) => f.write_str(version),
        }
    }
}

/// Fetches and interprets manifests.
///
/// Manifests are fetched fresh on every call; nothing is cached.
#[derive(Clone)]
pub struct ManifestResolver {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    base: Url,
}

impl ManifestResolver {
    /// Creates a resolver for manifests under `base`.
    ///
    /// A trailing slash is added to `base` if missing so that namespaces are
    /// joined below it rather than replacing its last segment.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, base: Url) -> Self {
        Self {
            transport,
            policy,
            base: with_trailing_slash(base),
        }
    }

    /// The normalized base URL.
    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Fetches `<base>/<namespace>/manifest.json`.
    ///
    /// # Errors
    ///
    /// Returns network errors (after retries) and parse errors.
    pub fn fetch_root(&self, namespace: &str) -> Result<RootManifest> {
        let url = join(&self.base, &format!("{namespace}/{ROOT_MANIFEST_FILE}"))?;
        let _span = tracing::info_span!("fetch_root_manifest", namespace, %url).entered();

        let bytes = self.fetch_bytes(&url)?;
        let root = RootManifest::parse(&bytes, namespace, &url)?;
        tracing::debug!(
            platforms = root.platforms(namespace).len(),
            "root manifest loaded"
        );
        Ok(root)
    }

    /// Looks up the platform manifest location for `target` in `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::UnsupportedTarget`] if the root manifest has
    /// no entry for the target.
    pub fn resolve_platform(&self, root: &RootManifest, target: &Target) -> Result<Url> {
        root.location(target.namespace(), target.platform(), target.arch())
            .cloned()
            .ok_or_else(|| ToolchainError::UnsupportedTarget {
                namespace: target.namespace().to_string(),
                platform: target.platform().to_string(),
                arch: target.arch().to_string(),
            })
    }

    /// Fetches and parses a platform manifest.
    ///
    /// # Errors
    ///
    /// Returns network errors (after retries) and parse errors.
    pub fn fetch_platform_manifest(&self, location: &Url) -> Result<PlatformManifest> {
        let _span = tracing::info_span!("fetch_platform_manifest", url = %location).entered();

        let bytes = self.fetch_bytes(location)?;
        let manifest = PlatformManifest::parse(&bytes, location)?;
        tracing::debug!(
            latest = %manifest.latest,
            versions = manifest.versions.len(),
            "platform manifest loaded"
        );
        Ok(manifest)
    }

    /// Picks the archive for `request`.
    ///
    /// `Latest` resolves to the entry keyed by the manifest's declared
    /// `latest`, never to the highest version present.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::VersionNotFound`] if the manifest has no such
    /// entry.
    pub fn resolve_version(
        &self,
        manifest: &PlatformManifest,
        request: &VersionRequest,
    ) -> Result<(String, ArchiveSpec)> {
        resolve_version(manifest, request)
    }

    /// Root manifest, platform lookup and version resolution in one go.
    ///
    /// # Errors
    ///
    /// Returns the first failure of any step.
    pub fn resolve(
        &self,
        target: &Target,
        request: &VersionRequest,
    ) -> Result<(String, ArchiveSpec)> {
        let root = self.fetch_root(target.namespace())?;
        let location = self.resolve_platform(&root, target)?;
        let manifest = self.fetch_platform_manifest(&location)?;
        resolve_version(&manifest, request)
    }

    fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        self.policy
            .run(url.as_str(), |_| get_bytes(self.transport.as_ref(), url))
    }
}

impl std::fmt::Debug for ManifestResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestResolver")
            .field("base", &self.base.as_str())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Picks the archive for `request` from `manifest`.
///
/// # Errors
///
/// Returns [`ToolchainError::VersionNotFound`] if the manifest has no such
/// entry.
pub fn resolve_version(
    manifest: &PlatformManifest,
    request: &VersionRequest,
) -> Result<(String, ArchiveSpec)> {
    let version = match request {
        VersionRequest::Latest => manifest.latest.as_str(),
        VersionRequest::Exact(version) => version.as_str(),
    };

    manifest
        .versions
        .get(version)
        .map(|spec| (version.to_string(), spec.clone()))
        .ok_or_else(|| ToolchainError::VersionNotFound {
            requested: if version.is_empty() {
                request.to_string()
            } else {
                version.to_string()
            },
            available: manifest.sorted_versions().join(", "),
        })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRootManifest {
    Listing { platforms: Vec<RawPlatformEntry> },
    Nested(BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>),
}

#[derive(Deserialize)]
struct RawPlatformEntry {
    platform: String,
    #[serde(default)]
    architectures: Vec<RawArchEntry>,
}

#[derive(Deserialize)]
struct RawArchEntry {
    arch: String,
    manifest_path: Option<String>,
    manifest_url: Option<String>,
}

impl RawArchEntry {
    fn location(&self) -> Option<&str> {
        self.manifest_path
            .as_deref()
            .or(self.manifest_url.as_deref())
    }
}

#[derive(Deserialize)]
struct RawVersionEntry {
    href: Option<String>,
    sha256: Option<String>,
    parts: Option<Vec<RawPart>>,
}

#[derive(Deserialize)]
struct RawPart {
    href: Option<String>,
    sha256: Option<String>,
    size: Option<u64>,
}

fn build_spec(
    source: &Url,
    version: &str,
    href: &str,
    sha256: String,
    parts: Vec<RawPart>,
) -> Result<ArchiveSpec> {
    let sha256 = checked_sha256(source, &sha256, || format!("version {version}"))?;
    if parts.is_empty() {
        return Ok(ArchiveSpec::Single {
            href: join(source, href)?,
            sha256,
        });
    }

    let mut resolved = Vec::with_capacity(parts.len());
    for (index, part) in parts.into_iter().enumerate() {
        let (Some(part_href), Some(part_sha256)) = (part.href, part.sha256) else {
            return Err(invalid(
                source,
                format!("part {} of version {version} lacks href or sha256", index + 1),
            ));
        };
        let part_sha256 = checked_sha256(source, &part_sha256, || {
            format!("part {} of version {version}", index + 1)
        })?;
        resolved.push(ArchivePart {
            href: join(source, &part_href)?,
            sha256: part_sha256,
            size: part.size,
        });
    }

    Ok(ArchiveSpec::MultiPart {
        parts: resolved,
        whole_sha256: sha256,
    })
}

/// A SHA256 digest as 64 hex digits, lowercased. Digests name cache files, so
/// anything else is refused.
fn checked_sha256(source: &Url, sha256: &str, subject: impl FnOnce() -> String) -> Result<String> {
    if sha256.len() == 64 && sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(sha256.to_ascii_lowercase())
    } else {
        Err(invalid(
            source,
            format!("{} has a malformed sha256 {sha256:?}", subject()),
        ))
    }
}

fn join(base: &Url, reference: &str) -> Result<Url> {
    base.join(reference)
        .map_err(|e| invalid(base, format!("invalid location {reference:?}: {e}")))
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn parse_error(url: &Url, source: serde_json::Error) -> ToolchainError {
    ToolchainError::ManifestParse {
        url: url.to_string(),
        source,
    }
}

fn invalid(url: &Url, message: impl Into<String>) -> ToolchainError {
    ToolchainError::InvalidManifest {
        url: url.to_string(),
        message: message.into(),
    }
}
