//! Acquisition of the base cloud image.
//!
//! The base image is a host-level cache keyed by its local path: if a file
//! is present it is reused as-is, otherwise it is streamed from the mirror
//! in fixed-size chunks. A transfer counts as complete only when the
//! number of bytes on disk equals the size the server declared; anything
//! else is a failure, and the partial file is left in place for
//! inspection.
//!
//! Two provisioning runs racing on an absent image are not supported; no
//! lock is taken around the download.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::time::Duration;

use camino::Utf8Path;
use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::command_run::HostRunner;
use crate::config::HostConfig;
use crate::network;

/// Size of each read from the network stream.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error during transfer: {0}")]
    Io(#[from] std::io::Error),
    #[error("server did not declare a content length; cannot verify the transfer")]
    MissingLength,
    #[error("file size mismatch, download is incomplete: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

/// An opened transfer: the declared length and a reader over the body.
pub struct Download {
    pub declared_len: Option<u64>,
    pub body: Box<dyn Read>,
}

/// Something base images can be fetched from.
pub trait ImageSource {
    fn open(&self, url: &str) -> Result<Download, TransferError>;
}

/// Fetches over HTTP(S). The timeout bounds the whole transfer.
pub struct HttpSource {
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl ImageSource for HttpSource {
    fn open(&self, url: &str) -> Result<Download, TransferError> {
        let response = self.client.get(url).send()?.error_for_status()?;
        debug!(
            "GET {url}: {} (content-length {:?})",
            response.status(),
            response.content_length()
        );
        Ok(Download {
            declared_len: response.content_length(),
            body: Box::new(response),
        })
    }
}

/// How [`ensure_base_image`] satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The file was already present; nothing was fetched.
    Cached,
    Downloaded { bytes: u64 },
}

/// Make sure the base image exists at `path`, downloading it from `url` if not.
///
/// `progress` receives `(bytes_written, declared_total)` after every chunk.
/// When `expected_sha256` is given, a fresh download must match it; a
/// cached file is never re-verified.
pub fn ensure_base_image(
    path: &Utf8Path,
    url: &str,
    source: &dyn ImageSource,
    expected_sha256: Option<&str>,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<Acquired, TransferError> {
    if path.exists() {
        info!("Using cached base image at {path}");
        return Ok(Acquired::Cached);
    }

    info!("Image not found, downloading from {url}");
    let Download {
        declared_len,
        mut body,
    } = source.open(url)?;
    let total = declared_len.ok_or(TransferError::MissingLength)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    let mut hasher = Sha256::new();
    let copied = copy_chunks(body.as_mut(), &mut out, &mut hasher, total, progress);
    // Flush even on failure so the partial file reflects every byte received.
    let flushed = out.flush();
    let written = copied?;
    flushed?;

    let actual = std::fs::metadata(path)?.len();
    if actual != total {
        return Err(TransferError::SizeMismatch {
            expected: total,
            actual,
        });
    }

    if let Some(expected) = expected_sha256 {
        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(TransferError::DigestMismatch {
                expected: expected.trim().to_owned(),
                actual,
            });
        }
        debug!("SHA-256 verified: {actual}");
    }

    info!("Download complete: {written} bytes");
    Ok(Acquired::Downloaded { bytes: written })
}

fn copy_chunks(
    body: &mut dyn Read,
    out: &mut impl Write,
    hasher: &mut Sha256,
    total: u64,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        out.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        written += n as u64;
        progress(written, total);
    }
    Ok(written)
}

/// Options for the `fetch-image` command.
#[derive(Debug, Parser)]
pub struct FetchImageOpts {
    /// Source URL (default: selected from the site profiles for this host)
    #[clap(long)]
    pub url: Option<String>,

    #[clap(flatten)]
    pub host: HostConfig,
}

/// Execute the `fetch-image` command.
pub fn run(opts: FetchImageOpts) -> Result<()> {
    let url = match opts.url {
        Some(url) => url,
        None => {
            let profiles = opts.host.site.site_profiles()?;
            let (host_ip, _) = network::resolve_host_network(&HostRunner)?;
            network::select_image_source(&profiles, host_ip).to_owned()
        }
    };
    let source = HttpSource::new(Duration::from_secs(opts.host.download_timeout))
        .context("Creating HTTP client")?;
    let pb = crate::progress::create_download_progress_bar("Downloading base image");
    let r = ensure_base_image(
        &opts.host.base_image,
        &url,
        &source,
        opts.host.base_image_sha256.as_deref(),
        &mut crate::progress::bar_callback(&pb),
    );
    pb.finish_and_clear();
    match r.with_context(|| format!("Fetching {url}"))? {
        Acquired::Cached => println!("Base image already present: {}", opts.host.base_image),
        Acquired::Downloaded { bytes } => {
            println!("Downloaded {bytes} bytes to {}", opts.host.base_image)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::cell::Cell;
    use std::io::Cursor;

    /// Serves a fixed body, optionally failing after a number of bytes.
    struct FakeSource {
        body: Vec<u8>,
        declared_len: Option<u64>,
        fail_after: Option<usize>,
        opened: Cell<usize>,
    }

    impl FakeSource {
        fn new(body: Vec<u8>) -> Self {
            let declared_len = Some(body.len() as u64);
            Self {
                body,
                declared_len,
                fail_after: None,
                opened: Cell::new(0),
            }
        }
    }

    struct FailingReader {
        inner: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.inner.read(buf)? {
                0 => Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )),
                n => Ok(n),
            }
        }
    }

    impl ImageSource for FakeSource {
        fn open(&self, _url: &str) -> Result<Download, TransferError> {
            self.opened.set(self.opened.get() + 1);
            let body: Box<dyn Read> = match self.fail_after {
                Some(m) => Box::new(FailingReader {
                    inner: Cursor::new(self.body[..m].to_vec()),
                }),
                None => Box::new(Cursor::new(self.body.clone())),
            };
            Ok(Download {
                declared_len: self.declared_len,
                body,
            })
        }
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(td.path().join("cache/base.qcow2")).unwrap();
        (td, path)
    }

    #[test]
    fn test_cache_hit_makes_no_network_call() {
        let (_td, path) = scratch();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"already here").unwrap();
        let source = FakeSource::new(vec![1; 10]);
        let r = ensure_base_image(&path, "http://mirror/x", &source, None, &mut |_, _| {}).unwrap();
        assert_eq!(r, Acquired::Cached);
        assert_eq!(source.opened.get(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"already here");
    }

    #[test]
    fn test_download_with_progress() {
        let (_td, path) = scratch();
        let body: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| i as u8).collect();
        let source = FakeSource::new(body.clone());
        let mut calls = Vec::new();
        let r = ensure_base_image(&path, "http://mirror/x", &source, None, &mut |w, t| {
            calls.push((w, t))
        })
        .unwrap();
        assert_eq!(r, Acquired::Downloaded { bytes: body.len() as u64 });
        assert_eq!(std::fs::read(&path).unwrap(), body);
        let total = body.len() as u64;
        assert_eq!(calls.last(), Some(&(total, total)));
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_short_stream_is_size_mismatch() {
        let (_td, path) = scratch();
        let mut source = FakeSource::new(vec![7; 1000]);
        source.declared_len = Some(2500);
        let err = ensure_base_image(&path, "http://mirror/x", &source, None, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::SizeMismatch {
                expected: 2500,
                actual: 1000
            }
        ));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1000);
    }

    #[test]
    fn test_interrupted_stream_leaves_partial_file() {
        let (_td, path) = scratch();
        let mut source = FakeSource::new(vec![3; 100_000]);
        source.fail_after = Some(40_000);
        let err = ensure_base_image(&path, "http://mirror/x", &source, None, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40_000);
    }

    #[test]
    fn test_missing_length_is_refused_before_writing() {
        let (_td, path) = scratch();
        let mut source = FakeSource::new(vec![1; 10]);
        source.declared_len = None;
        let err = ensure_base_image(&path, "http://mirror/x", &source, None, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingLength));
        assert!(!path.exists());
    }

    #[test]
    fn test_digest_verification() {
        let (_td, path) = scratch();
        let source = FakeSource::new(b"hello".to_vec());
        // sha256("hello")
        let good = "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824";
        ensure_base_image(&path, "u", &source, Some(good), &mut |_, _| {}).unwrap();

        let (_td2, path2) = scratch();
        let err = ensure_base_image(&path2, "u", &source, Some("00"), &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, TransferError::DigestMismatch { .. }));
    }
}
