use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::descriptor::Arch;
use crate::error::VmError;
use crate::runner::CommandRunner;

/// A base image we know how to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownImage {
    pub name: &'static str,
    pub description: &'static str,
    amd64_url: &'static str,
    arm64_url: &'static str,
}

impl KnownImage {
    pub fn url(&self, arch: Arch) -> &'static str {
        match arch {
            Arch::Amd64 => self.amd64_url,
            Arch::Arm64 => self.arm64_url,
        }
    }
}

pub const KNOWN_IMAGES: &[KnownImage] = &[
    KnownImage {
        name: "debian13",
        description: "Debian 13 (trixie) generic cloud",
        amd64_url: "https://cloud.debian.org/images/cloud/trixie/latest/debian-13-genericcloud-amd64.qcow2",
        arm64_url: "https://cloud.debian.org/images/cloud/trixie/latest/debian-13-genericcloud-arm64.qcow2",
    },
    KnownImage {
        name: "debian12",
        description: "Debian 12 (bookworm) generic cloud",
        amd64_url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
        arm64_url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-genericcloud-arm64.qcow2",
    },
];

pub fn find_image(name: &str) -> Result<&'static KnownImage, VmError> {
    KNOWN_IMAGES
        .iter()
        .find(|i| i.name == name)
        .ok_or_else(|| VmError::Validation {
            message: format!(
                "unknown image '{name}' (known: {})",
                KNOWN_IMAGES.iter().map(|i| i.name).collect::<Vec<_>>().join(", ")
            ),
        })
}

/// Cache file name for an image/arch pair.
pub fn cache_file_name(image: &str, arch: Arch) -> String {
    format!("{image}-{arch}.qcow2")
}

/// Download a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), VmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VmError::io(format!("creating temp file {}", path.display()), e))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VmError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| VmError::io("writing image data", e))?;
        pb.inc(chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|e| VmError::io("flushing image file", e))?;

    Ok(())
}

/// Resolves a base image name to a verified local qcow2, downloading it into
/// the image cache on first use.
pub struct ImageResolver<R> {
    images_dir: PathBuf,
    qemu_img: String,
    runner: R,
}

impl<R: CommandRunner> ImageResolver<R> {
    pub fn new(images_dir: impl Into<PathBuf>, qemu_img: impl Into<String>, runner: R) -> Self {
        Self {
            images_dir: images_dir.into(),
            qemu_img: qemu_img.into(),
            runner,
        }
    }

    pub fn cached_path(&self, image: &str, arch: Arch) -> PathBuf {
        self.images_dir.join(cache_file_name(image, arch))
    }

    pub async fn resolve(&self, image: &str, arch: Arch) -> Result<PathBuf, VmError> {
        let known = find_image(image)?;
        let dest = self.cached_path(image, arch);
        if dest.is_file() {
            tracing::info!(path = %dest.display(), "using cached base image");
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&self.images_dir)
            .await
            .map_err(|e| VmError::io(format!("creating cache dir {}", self.images_dir.display()), e))?;

        let url = known.url(arch);
        tracing::info!(%url, %image, %arch, "downloading base image");

        let response = reqwest::get(url).await.map_err(|e| VmError::ImageDownload {
            message: format!("request to {url} failed"),
            source: Box::new(e),
        })?;

        if !response.status().is_success() {
            return Err(VmError::ImageDownload {
                message: format!("HTTP {} from {url}", response.status()),
                source: format!("HTTP {}", response.status()).into(),
            });
        }

        let pb = ProgressBar::new(response.content_length().unwrap_or(0));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let tmp_path = dest.with_extension("part");
        let _ = tokio::fs::remove_file(&tmp_path).await;

        if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            pb.abandon();
            return Err(e);
        }
        pb.finish_and_clear();

        // Verify before publishing so the cache only ever holds usable images.
        if let Err(e) = self.verify(&tmp_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp_path, &dest).await.map_err(|e| {
            VmError::io(
                format!("renaming {} to {}", tmp_path.display(), dest.display()),
                e,
            )
        })?;
        tracing::info!(path = %dest.display(), "base image cached");
        Ok(dest)
    }

    async fn verify(&self, path: &Path) -> Result<(), VmError> {
        let argv = vec![self.qemu_img.clone(), "info".into(), path.display().to_string()];
        self.runner.run(&argv).await?.check(&self.qemu_img)?;
        Ok(())
    }

    /// Copy the base image into a standalone qcow2 disk and grow it.
    pub async fn create_disk(&self, base: &Path, disk: &Path, size: &str) -> Result<(), VmError> {
        let convert = vec![
            self.qemu_img.clone(),
            "convert".into(),
            "-O".into(),
            "qcow2".into(),
            base.display().to_string(),
            disk.display().to_string(),
        ];
        self.runner.run(&convert).await?.check(&self.qemu_img)?;

        let resize = vec![
            self.qemu_img.clone(),
            "resize".into(),
            disk.display().to_string(),
            size.to_string(),
        ];
        self.runner.run(&resize).await?.check(&self.qemu_img)?;

        tracing::info!(path = %disk.display(), %size, "created VM disk");
        Ok(())
    }
}

/// One row of `lazyvm images`.
#[derive(Debug, Clone)]
pub struct ImageListing {
    pub image: &'static KnownImage,
    pub arch: Arch,
    /// Size of the cached file, if present.
    pub cached_bytes: Option<u64>,
}

pub fn list_images(images_dir: &Path) -> Vec<ImageListing> {
    KNOWN_IMAGES
        .iter()
        .flat_map(|image| {
            [Arch::Arm64, Arch::Amd64].into_iter().map(move |arch| ImageListing {
                image,
                arch,
                cached_bytes: std::fs::metadata(images_dir.join(cache_file_name(image.name, arch)))
                    .ok()
                    .filter(|m| m.is_file())
                    .map(|m| m.len()),
            })
        })
        .collect()
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ToolOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl CommandRunner for RecordingRunner {
        async fn run(&self, argv: &[String]) -> Result<ToolOutput, VmError> {
            self.calls.lock().unwrap().push(argv.to_vec());
            Ok(ToolOutput::ok())
        }
    }

    #[test]
    fn urls_per_arch() {
        let d13 = find_image("debian13").unwrap();
        assert!(d13.url(Arch::Arm64).ends_with("debian-13-genericcloud-arm64.qcow2"));
        assert!(d13.url(Arch::Amd64).ends_with("debian-13-genericcloud-amd64.qcow2"));
        let d12 = find_image("debian12").unwrap();
        assert!(d12.url(Arch::Amd64).ends_with("debian-12-generic-amd64.qcow2"));
    }

    #[test]
    fn unknown_image_rejected() {
        assert!(matches!(find_image("windows"), Err(VmError::Validation { .. })));
    }

    #[tokio::test]
    async fn cached_image_is_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("debian13-arm64.qcow2");
        std::fs::write(&cached, b"qcow").unwrap();
        let runner = RecordingRunner::default();
        let resolver = ImageResolver::new(dir.path(), "qemu-img", &runner);
        assert_eq!(resolver.resolve("debian13", Arch::Arm64).await.unwrap(), cached);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_image_fails_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ImageResolver::new(dir.path(), "qemu-img", RecordingRunner::default());
        assert!(resolver.resolve("plan9", Arch::Amd64).await.is_err());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn create_disk_converts_then_resizes() {
        let runner = RecordingRunner::default();
        let resolver = ImageResolver::new("/images", "qemu-img", &runner);
        resolver
            .create_disk(Path::new("/images/base.qcow2"), Path::new("/vm/disk.qcow2"), "20G")
            .await
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            ["qemu-img", "convert", "-O", "qcow2", "/images/base.qcow2", "/vm/disk.qcow2"]
        );
        assert_eq!(calls[1], ["qemu-img", "resize", "/vm/disk.qcow2", "20G"]);
    }

    #[test]
    fn listing_reports_cache_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("debian12-amd64.qcow2"), vec![0u8; 2048]).unwrap();
        let rows = list_images(dir.path());
        assert_eq!(rows.len(), KNOWN_IMAGES.len() * 2);
        let cached: Vec<_> = rows.iter().filter(|r| r.cached_bytes.is_some()).collect();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].image.name, "debian12");
        assert_eq!(cached[0].arch, Arch::Amd64);
        assert_eq!(format_size(cached[0].cached_bytes.unwrap()), "2.0 KB");
    }
}
