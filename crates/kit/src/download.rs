//! Guest image acquisition.
//!
//! An image stream names either a local file, a numbered release, or a
//! symbolic channel. Releases and channels are resolved against a remote
//! directory listing to one artifact; a cached copy is reused when its size
//! matches the advertised one (no digest is checked), otherwise the artifact
//! is streamed down in one attempt. The result is decompressed into the
//! machine's image path.

use std::fs::File;
use std::io::{BufReader, Read};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::errors::MachineError;

/// Release used for an empty stream or `testing`.
pub(crate) const DEFAULT_RELEASE: &str = "40";

/// Cap on how much of a directory listing is read.
const INDEX_READ_LIMIT: u64 = 10 * 1024 * 1024;

/// The whole transfer must finish within this.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const FEDORA_ROOTFS_INDEX: &str = "https://github.com/fedora-cloud/docker-brew-fedora/";
const FEDORA_CLOUD_INDEX: &str =
    "https://download.fedoraproject.org/pub/fedora/linux/releases/{release}/Cloud/{arch}/images/";

/// Stream name recorded for a local image.
pub(crate) const CUSTOM_STREAM: &str = "custom";

/// Where a guest image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImageStream {
    /// A local file, used as-is
    Custom(Utf8PathBuf),
    /// A numbered release
    Release(String),
    /// A symbolic name that must resolve remotely
    Channel(String),
}

impl ImageStream {
    pub(crate) fn parse(s: &str) -> Self {
        if s.is_empty() || s == "testing" {
            return ImageStream::Release(DEFAULT_RELEASE.to_owned());
        }
        let p = Utf8Path::new(s);
        if p.exists() {
            return ImageStream::Custom(p.to_owned());
        }
        if s.chars().all(|c| c.is_ascii_digit()) {
            ImageStream::Release(s.to_owned())
        } else {
            ImageStream::Channel(s.to_owned())
        }
    }

    /// The value recorded as the machine's `ImageStream`.
    pub(crate) fn name(&self) -> &str {
        match self {
            ImageStream::Custom(_) => CUSTOM_STREAM,
            ImageStream::Release(r) => r,
            ImageStream::Channel(c) => c,
        }
    }
}

/// One concrete remote artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedArtifact {
    pub(crate) version: String,
    pub(crate) url: String,
    /// Advertised size, when the server reported one
    pub(crate) size: Option<u64>,
}

impl ResolvedArtifact {
    fn base_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }

    /// File name the artifact is cached under.
    pub(crate) fn cache_key(&self) -> String {
        format!("{}-{}", self.version, self.base_name())
    }
}

/// Resolves releases and channels to artifacts.
pub(crate) trait ArtifactIndex {
    fn resolve(&self, release: &str) -> Result<ResolvedArtifact>;
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "aarch64",
        _ => "x86_64",
    }
}

pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .user_agent(concat!("machinekit/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Building HTTP client")
}

/// A remote directory listing scanned for an artifact name.
#[derive(Debug)]
pub(crate) struct RemoteIndex {
    /// Listing location; `{release}` and `{arch}` are substituted
    listing_url: String,
    /// Prefix the discovered file name is appended to
    artifact_url: String,
    pattern: Regex,
    client: Client,
}

impl RemoteIndex {
    pub(crate) fn new(listing_url: &str, artifact_url: &str, pattern: &str) -> Result<Self> {
        Ok(Self {
            listing_url: listing_url.to_owned(),
            artifact_url: artifact_url.to_owned(),
            pattern: Regex::new(pattern)?,
            client: http_client()?,
        })
    }

    /// Fedora container root filesystems, as imported into WSL.
    pub(crate) fn fedora_rootfs() -> Result<Self> {
        Self::new(
            &format!("{FEDORA_ROOTFS_INDEX}tree/{{release}}/{{arch}}/"),
            &format!("{FEDORA_ROOTFS_INDEX}raw/{{release}}/{{arch}}/"),
            r#"fedora[^"]+xz"#,
        )
    }

    /// Fedora Cloud disk images, as booted by QEMU.
    pub(crate) fn fedora_cloud() -> Result<Self> {
        Self::new(
            FEDORA_CLOUD_INDEX,
            FEDORA_CLOUD_INDEX,
            r#"Fedora-Cloud-Base-Generic[^"]+qcow2"#,
        )
    }

    fn expand(template: &str, release: &str) -> String {
        template
            .replace("{release}", release)
            .replace("{arch}", host_arch())
    }

    /// Read at most [`INDEX_READ_LIMIT`] bytes of the listing.
    fn read_listing(&self, url: &str, release: &str) -> Result<String> {
        debug!("Fetching index {url}");
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| MachineError::DownloadFailed {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(MachineError::ImageNotFound(release.to_owned()).into())
            }
            s => {
                return Err(MachineError::DownloadFailed {
                    url: url.to_owned(),
                    reason: format!("HTTP {s}"),
                }
                .into())
            }
        }
        let mut body = Vec::new();
        resp.take(INDEX_READ_LIMIT)
            .read_to_end(&mut body)
            .map_err(|e| MachineError::DownloadFailed {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn head_size(&self, url: &str) -> Result<Option<u64>> {
        let resp = self
            .client
            .head(url)
            .send()
            .map_err(|e| MachineError::DownloadFailed {
                url: url.to_owned(),
                reason: format!("HEAD request failed: {e}"),
            })?;
        if resp.status() != StatusCode::OK {
            return Err(MachineError::DownloadFailed {
                url: url.to_owned(),
                reason: format!("HEAD request returned {}", resp.status()),
            }
            .into());
        }
        // The body of a HEAD response is empty, so read the header itself.
        Ok(resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }
}

impl ArtifactIndex for RemoteIndex {
    fn resolve(&self, release: &str) -> Result<ResolvedArtifact> {
        let listing = Self::expand(&self.listing_url, release);
        let body = self.read_listing(&listing, release)?;
        let file = self.pattern.find(&body).map(|m| m.as_str()).ok_or_else(|| {
            MachineError::ImageNotFound(format!("could not locate {release} download at {listing}"))
        })?;
        let url = format!("{}{file}", Self::expand(&self.artifact_url, release));
        let size = self.head_size(&url)?;
        Ok(ResolvedArtifact {
            version: release.to_owned(),
            url,
            size,
        })
    }
}

/// One acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DownloadDescriptor {
    pub(crate) url: String,
    pub(crate) size: Option<u64>,
    pub(crate) local_compressed_path: Utf8PathBuf,
    pub(crate) local_uncompressed_path: Utf8PathBuf,
}

impl DownloadDescriptor {
    pub(crate) fn new(art: &ResolvedArtifact, cache_dir: &Utf8Path, image_path: &Utf8Path) -> Self {
        Self {
            url: art.url.clone(),
            size: art.size,
            local_compressed_path: cache_dir.join(art.cache_key()),
            local_uncompressed_path: image_path.to_owned(),
        }
    }

    /// Whether the cached artifact can be reused. Only the size is compared.
    pub(crate) fn is_cached(&self) -> bool {
        match std::fs::metadata(&self.local_compressed_path) {
            Ok(m) => self.size.map_or(true, |s| m.len() == s),
            Err(_) => false,
        }
    }

    /// Stream the artifact into the cache, bounded to the advertised length.
    pub(crate) fn fetch(&self, client: &Client) -> Result<()> {
        let failed = |reason: String| MachineError::DownloadFailed {
            url: self.url.clone(),
            reason,
        };
        let cache_dir = self
            .local_compressed_path
            .parent()
            .ok_or_else(|| eyre!("Invalid cache path {}", self.local_compressed_path))?;
        std::fs::create_dir_all(cache_dir).with_context(|| format!("Creating {cache_dir}"))?;

        info!("Downloading {}", self.url);
        let resp = client
            .get(&self.url)
            .send()
            .map_err(|e| failed(e.to_string()))?;
        if resp.status() != StatusCode::OK {
            return Err(failed(format!("HTTP {}", resp.status())).into());
        }
        let expected = self.size.or(resp.content_length());

        let pb = ProgressBar::new(expected.unwrap_or(0));
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("#>-"),
        );
        let mut tmp = tempfile::NamedTempFile::new_in(cache_dir)?;
        let mut reader = pb.wrap_read(resp);
        let copied = match expected {
            Some(len) => std::io::copy(&mut (&mut reader).take(len), &mut tmp),
            None => std::io::copy(&mut reader, &mut tmp),
        }
        .map_err(|e| failed(e.to_string()))?;
        pb.finish_and_clear();

        if let Some(len) = expected {
            if copied != len {
                return Err(failed(format!("truncated body: got {copied} of {len} bytes")).into());
            }
        }
        tmp.persist(&self.local_compressed_path)
            .with_context(|| format!("Saving {}", self.local_compressed_path))?;
        Ok(())
    }
}

/// Decompress `src` into `dst` according to its extension; unknown
/// extensions are copied.
pub(crate) fn decompress(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let dst_dir = dst
        .parent()
        .ok_or_else(|| eyre!("Invalid image path {dst}"))?;
    std::fs::create_dir_all(dst_dir).with_context(|| format!("Creating {dst_dir}"))?;
    let input = File::open(src).with_context(|| format!("Opening {src}"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dst_dir)?;

    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg} {bytes}")?);
    pb.set_message(format!("Extracting {}", src.file_name().unwrap_or(src.as_str())));
    pb.enable_steady_tick(Duration::from_millis(100));
    let mut out = pb.wrap_write(&mut tmp);
    let r = match src.extension() {
        Some("xz") => std::io::copy(
            &mut xz2::read::XzDecoder::new_multi_decoder(BufReader::new(input)),
            &mut out,
        ),
        Some("gz") => std::io::copy(&mut flate2::read::GzDecoder::new(input), &mut out),
        _ => std::io::copy(&mut BufReader::new(input), &mut out),
    };
    drop(out);
    pb.finish_and_clear();
    r.with_context(|| format!("Decompressing {src}"))?;

    tmp.persist(dst).with_context(|| format!("Saving {dst}"))?;
    Ok(())
}

/// Produce the disk image for `stream` at `image_path`.
pub(crate) fn acquire(
    stream: &ImageStream,
    index: &dyn ArtifactIndex,
    cache_dir: &Utf8Path,
    image_path: &Utf8Path,
) -> Result<()> {
    match stream {
        ImageStream::Custom(p) => decompress(p, image_path),
        ImageStream::Release(r) | ImageStream::Channel(r) => {
            let art = index.resolve(r)?;
            let desc = DownloadDescriptor::new(&art, cache_dir, image_path);
            if desc.is_cached() {
                info!("Using cached image {}", desc.local_compressed_path);
            } else {
                desc.fetch(&http_client()?)?;
            }
            decompress(&desc.local_compressed_path, &desc.local_uncompressed_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, Write};
    use std::net::TcpListener;

    use flate2::write::GzEncoder;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::errors::machine_error;

    struct FixedIndex(ResolvedArtifact);

    impl ArtifactIndex for FixedIndex {
        fn resolve(&self, _release: &str) -> Result<ResolvedArtifact> {
            Ok(self.0.clone())
        }
    }

    /// Answer `n` HTTP requests, choosing each raw response from the request
    /// line. Returns the base URL.
    fn serve(n: usize, respond: impl Fn(&str) -> Vec<u8> + Send + 'static) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming().take(n) {
                let mut stream = stream.unwrap();
                let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                loop {
                    let mut l = String::new();
                    reader.read_line(&mut l).unwrap();
                    if l == "\r\n" || l.is_empty() {
                        break;
                    }
                }
                let _ = stream.write_all(&respond(&request_line));
            }
        });
        format!("http://{addr}/")
    }

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8Path::from_path(td.path()).unwrap().to_owned();
        (td, p)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut e = GzEncoder::new(Vec::new(), flate2::Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    #[test]
    fn test_stream_parse() {
        let (_td, dir) = utf8_tempdir();
        assert_eq!(
            ImageStream::parse(""),
            ImageStream::Release(DEFAULT_RELEASE.into())
        );
        assert_eq!(
            ImageStream::parse("testing"),
            ImageStream::Release(DEFAULT_RELEASE.into())
        );
        assert_eq!(ImageStream::parse("39"), ImageStream::Release("39".into()));
        assert_eq!(
            ImageStream::parse("rawhide"),
            ImageStream::Channel("rawhide".into())
        );
        let s = ImageStream::parse(dir.as_str());
        assert_eq!(s, ImageStream::Custom(dir.clone()));
        assert_eq!(s.name(), "custom");
    }

    #[test]
    fn test_cache_key() {
        let a = ResolvedArtifact {
            version: "40".into(),
            url: "https://h/raw/40/x86_64/fedora-40-x86_64.tar.xz".into(),
            size: Some(3),
        };
        assert_eq!(a.cache_key(), "40-fedora-40-x86_64.tar.xz");
    }

    #[test]
    fn test_cache_hit_skips_download() {
        let (_td, dir) = utf8_tempdir();
        let payload = gzip(b"root filesystem");
        let art = ResolvedArtifact {
            version: "40".into(),
            // Nothing listens here; a download attempt would fail.
            url: "http://127.0.0.1:9/rootfs.tar.gz".into(),
            size: Some(payload.len() as u64),
        };
        let cache = dir.join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join(art.cache_key()), &payload).unwrap();

        let image = dir.join("img/dev.tar");
        acquire(
            &ImageStream::Release("40".into()),
            &FixedIndex(art),
            &cache,
            &image,
        )
        .unwrap();
        assert_eq!(std::fs::read(&image).unwrap(), b"root filesystem");
    }

    #[test]
    fn test_size_mismatch_refetches() {
        let (_td, dir) = utf8_tempdir();
        let payload = gzip(b"fresh");
        let body = payload.clone();
        let base = serve(1, move |_| {
            let mut r = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            r.extend_from_slice(&body);
            r
        });
        let art = ResolvedArtifact {
            version: "40".into(),
            url: format!("{base}rootfs.tar.gz"),
            size: Some(payload.len() as u64),
        };
        let cache = dir.join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join(art.cache_key()), b"stale").unwrap();

        let image = dir.join("dev.tar");
        acquire(&ImageStream::Channel("x".into()), &FixedIndex(art), &cache, &image).unwrap();
        assert_eq!(std::fs::read(&image).unwrap(), b"fresh");
    }

    #[test]
    fn test_truncated_download() {
        let (_td, dir) = utf8_tempdir();
        let base = serve(1, |_| {
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nshort".to_vec()
        });
        let art = ResolvedArtifact {
            version: "40".into(),
            url: format!("{base}rootfs.tar.xz"),
            size: Some(100),
        };
        let desc = DownloadDescriptor::new(&art, &dir.join("cache"), &dir.join("dev.tar"));
        let err = desc.fetch(&http_client().unwrap()).unwrap_err();
        assert!(matches!(
            machine_error(&err),
            Some(MachineError::DownloadFailed { .. })
        ));
        assert!(!desc.local_compressed_path.exists());
    }

    #[test]
    fn test_http_error_is_download_failure() {
        let (_td, dir) = utf8_tempdir();
        let base = serve(1, |_| {
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_vec()
        });
        let art = ResolvedArtifact {
            version: "40".into(),
            url: format!("{base}rootfs.tar.xz"),
            size: None,
        };
        let desc = DownloadDescriptor::new(&art, &dir.join("cache"), &dir.join("dev.tar"));
        let err = desc.fetch(&http_client().unwrap()).unwrap_err();
        assert!(matches!(
            machine_error(&err),
            Some(MachineError::DownloadFailed { .. })
        ));
    }

    #[test]
    fn test_remote_index_resolution() {
        let listing = r#"<a href="/x/fedora-40.20240101-x86_64.tar.xz">fedora-40.20240101-x86_64.tar.xz</a>"#;
        let base = serve(2, move |req| {
            if req.starts_with("HEAD") {
                b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\nConnection: close\r\n\r\n".to_vec()
            } else {
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{listing}",
                    listing.len()
                )
                .into_bytes()
            }
        });
        let index = RemoteIndex::new(
            &format!("{base}tree/{{release}}/"),
            &format!("{base}raw/{{release}}/"),
            r#"fedora[^"]+xz"#,
        )
        .unwrap();
        let art = index.resolve("40").unwrap();
        assert_eq!(art.version, "40");
        assert_eq!(art.url, format!("{base}raw/40/fedora-40.20240101-x86_64.tar.xz"));
        assert_eq!(art.size, Some(1234));
    }

    #[test]
    fn test_unknown_channel_is_image_not_found() {
        let base = serve(1, |_| {
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
        });
        let index = RemoteIndex::new(
            &format!("{base}tree/{{release}}/"),
            &format!("{base}raw/{{release}}/"),
            r#"fedora[^"]+xz"#,
        )
        .unwrap();
        let err = index.resolve("nonsense").unwrap_err();
        assert_eq!(
            machine_error(&err),
            Some(&MachineError::ImageNotFound("nonsense".into()))
        );
    }

    #[test]
    fn test_decompress_xz_and_plain() {
        let (_td, dir) = utf8_tempdir();
        let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
        enc.write_all(b"xz payload").unwrap();
        let src = dir.join("a.tar.xz");
        std::fs::write(&src, enc.finish().unwrap()).unwrap();
        decompress(&src, &dir.join("out/a.tar")).unwrap();
        assert_eq!(std::fs::read(dir.join("out/a.tar")).unwrap(), b"xz payload");

        let src = dir.join("disk.qcow2");
        std::fs::write(&src, b"raw bytes").unwrap();
        decompress(&src, &dir.join("copy.qcow2")).unwrap();
        assert_eq!(std::fs::read(dir.join("copy.qcow2")).unwrap(), b"raw bytes");
    }
}
