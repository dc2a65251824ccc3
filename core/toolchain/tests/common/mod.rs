//! Shared fixtures for integration tests: an in-memory distribution server
//! and archive builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use inference_toolchain::transport::Body;
use inference_toolchain::{RemoteInfo, Result, Target, ToolchainError, Transport};
use sha2::{Digest, Sha256};
use url::Url;

/// Base URL of the fake distribution server.
pub const BASE: &str = "https://dist.test/toolchains/";

/// How the mock answers HEAD and ranged requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ranges {
    /// No HEAD support; clients use plain GETs.
    #[default]
    Unsupported,
    /// Advertises `Accept-Ranges: bytes` and serves ranges.
    Served,
    /// Advertises ranges but answers with the whole file, like a
    /// misconfigured proxy.
    Ignored,
}

/// Serves fixed bodies from memory and counts every request.
///
/// Unknown URLs answer 404. URLs registered with [`MockTransport::fail_times`]
/// fail with a transient network error that many times before succeeding;
/// plain and ranged GETs share that budget. Plain GETs are counted by
/// [`MockTransport::hits`], ranged ones by [`MockTransport::range_hits`].
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, u32>>,
    hits: Mutex<HashMap<String, u32>>,
    range_hits: Mutex<HashMap<String, u32>>,
    total: AtomicU32,
    delay: Duration,
    ranges: Ranges,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps before answering each request, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_ranges(mut self, ranges: Ranges) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .expect("Should lock routes")
            .insert(url.to_string(), body.into());
    }

    pub fn fail_times(&self, url: &str, times: u32) {
        self.failures
            .lock()
            .expect("Should lock failures")
            .insert(url.to_string(), times);
    }

    pub fn hits(&self, url: &str) -> u32 {
        self.hits
            .lock()
            .expect("Should lock hits")
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn range_hits(&self, url: &str) -> u32 {
        self.range_hits
            .lock()
            .expect("Should lock range hits")
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    /// Counts a request, waits, applies injected failures and looks up the
    /// body.
    fn answer(&self, url: &Url, counter: &Mutex<HashMap<String, u32>>) -> Result<Vec<u8>> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *counter
            .lock()
            .expect("Should lock counter")
            .entry(url.to_string())
            .or_insert(0) += 1;

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        {
            let mut failures = self.failures.lock().expect("Should lock failures");
            if let Some(remaining) = failures.get_mut(url.as_str())
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(ToolchainError::network(url.as_str(), "connection reset by peer"));
            }
        }

        let routes = self.routes.lock().expect("Should lock routes");
        routes.get(url.as_str()).cloned().ok_or_else(|| ToolchainError::Http {
            url: url.to_string(),
            status: 404,
        })
    }
}

impl Transport for MockTransport {
    fn get(&self, url: &Url) -> Result<Body> {
        let body = self.answer(url, &self.hits)?;
        Ok(Box::new(Cursor::new(body)))
    }

    fn head(&self, url: &Url) -> Result<Option<RemoteInfo>> {
        if self.ranges == Ranges::Unsupported {
            return Ok(None);
        }
        let routes = self.routes.lock().expect("Should lock routes");
        Ok(routes.get(url.as_str()).map(|body| RemoteInfo {
            length: Some(body.len() as u64),
            accepts_ranges: true,
        }))
    }

    fn get_range(&self, url: &Url, start: u64, end: u64) -> Result<Body> {
        let body = self.answer(url, &self.range_hits)?;
        if self.ranges != Ranges::Served {
            return Err(ToolchainError::RangeUnsupported {
                url: url.to_string(),
            });
        }
        let start = usize::try_from(start).expect("Should fit in usize");
        let end = usize::try_from(end).expect("Should fit in usize");
        Ok(Box::new(Cursor::new(body[start..=end].to_vec())))
    }
}

pub fn target(namespace: &str) -> Target {
    Target::new(namespace, "linux", "x86_64").expect("Should build target")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `<base>/<namespace>/manifest.json`
pub fn root_manifest_url(target: &Target) -> String {
    format!("{BASE}{}/manifest.json", target.namespace())
}

/// `<base>/<namespace>/<platform>-<arch>.json`
pub fn platform_manifest_url(target: &Target) -> String {
    format!(
        "{BASE}{}/{}-{}.json",
        target.namespace(),
        target.platform(),
        target.arch()
    )
}

/// Resolution of an href relative to the platform manifest.
pub fn archive_url(target: &Target, href: &str) -> String {
    format!("{BASE}{}/{href}", target.namespace())
}

/// Publishes a root manifest pointing `target` at its platform manifest.
pub fn publish_root(transport: &MockTransport, target: &Target) {
    let body = serde_json::json!({
        target.namespace(): {
            target.platform(): {
                target.arch(): format!("{}-{}.json", target.platform(), target.arch())
            }
        }
    });
    transport.serve(&root_manifest_url(target), body.to_string());
}

pub fn publish_platform(transport: &MockTransport, target: &Target, manifest: &serde_json::Value) {
    transport.serve(&platform_manifest_url(target), manifest.to_string());
}

/// Publishes manifests and a single-file archive for `version`, marked latest.
///
/// Returns the archive URL.
pub fn publish_single(
    transport: &MockTransport,
    target: &Target,
    version: &str,
    archive: &[u8],
) -> String {
    let href = format!("{}-{version}.pkg", target.slug());
    publish_root(transport, target);
    publish_platform(
        transport,
        target,
        &serde_json::json!({
            "latest": version,
            "versions": { version: { "href": href, "sha256": sha256_hex(archive) } }
        }),
    );
    let url = archive_url(target, &href);
    transport.serve(&url, archive.to_vec());
    url
}

/// Publishes manifests for a multi-part archive and serves every part.
///
/// Returns the part URLs in manifest order.
pub fn publish_multi_part(
    transport: &MockTransport,
    target: &Target,
    version: &str,
    parts: &[Vec<u8>],
    whole_sha256: &str,
) -> Vec<String> {
    publish_root(transport, target);
    let mut listed = Vec::new();
    let mut urls = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        let href = format!("{}-{version}.pkg.{:03}", target.slug(), i + 1);
        let url = archive_url(target, &href);
        transport.serve(&url, part.clone());
        listed.push(serde_json::json!({
            "href": href,
            "sha256": sha256_hex(part),
            "size": part.len(),
        }));
        urls.push(url);
    }
    publish_platform(
        transport,
        target,
        &serde_json::json!({
            "latest": version,
            "versions": {
                version: {
                    "href": format!("{}-{version}.pkg", target.slug()),
                    "sha256": whole_sha256,
                    "parts": listed,
                }
            }
        }),
    );
    urls
}

fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        {
            let raw = name.as_bytes();
            header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
        }
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(if name.contains("/bin/") { 0o755 } else { 0o644 });
        header.set_cksum();
        builder.append(&header, *data).expect("Should append entry");
    }
    builder.into_inner().expect("Should finish tar")
}

/// A gzip-compressed tarball. Names are written verbatim, so hostile paths
/// such as `../../escape` are possible.
pub fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&tar_bytes(entries))
        .expect("Should compress");
    encoder.finish().expect("Should finish gzip")
}

/// A gzip-compressed tarball of regular files followed by symlinks
/// (`(name, target)`), written verbatim.
pub fn tar_gz_with_links(files: &[(&str, &[u8])], links: &[(&str, &str)]) -> Vec<u8> {
    let mut raw = tar_bytes(files);
    // Drop the end-of-archive blocks, append the links, then finish again.
    raw.truncate(raw.len() - 1024);
    let mut builder = tar::Builder::new(raw);
    for (name, target) in links {
        let mut header = tar::Header::new_gnu();
        {
            let old = header.as_old_mut();
            old.name[..name.len()].copy_from_slice(name.as_bytes());
            old.linkname[..target.len()].copy_from_slice(target.as_bytes());
        }
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        builder.append(&header, std::io::empty()).expect("Should append link");
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&builder.into_inner().expect("Should finish tar"))
        .expect("Should compress");
    encoder.finish().expect("Should finish gzip")
}

pub fn tar_zst(entries: &[(&str, &[u8])]) -> Vec<u8> {
    zstd::encode_all(tar_bytes(entries).as_slice(), 0).expect("Should compress")
}

pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
        zip.start_file(*name, options).expect("Should start file");
        zip.write_all(data).expect("Should write");
    }
    zip.finish().expect("Should finish zip").into_inner()
}

/// A small toolchain with a common top-level folder.
pub fn toolchain_tar_gz(version: &str) -> Vec<u8> {
    let tool = format!("toolchain-{version}/bin/tool");
    let readme = format!("toolchain-{version}/README");
    tar_gz(&[
        (tool.as_str(), b"#!/bin/sh\necho tool\n".as_slice()),
        (readme.as_str(), version.as_bytes()),
    ])
}
