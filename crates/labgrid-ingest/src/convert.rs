//! Disk image conversion.
//!
//! Every accepted source format is normalised to qcow2, the runtime disk
//! format. OVA files are tar archives; the first VMDK inside is converted.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use lab_core::CommandRunner;
use lab_core::config::IngestConfig;

use crate::error::{IngestError, IngestResult};

/// Boxed future returned by [`DiskConverter::convert`]; resolves to the
/// size of the converted image in bytes.
pub type ConvertFuture<'a> = Pin<Box<dyn Future<Output = IngestResult<u64>> + Send + 'a>>;

pub trait DiskConverter: Send + Sync {
    /// Convert `source` (of source `format`) into a qcow2 image at `output`.
    /// `work_dir` is scratch space owned by the caller.
    fn convert<'a>(
        &'a self,
        source: &'a Path,
        format: &'a str,
        work_dir: &'a Path,
        output: &'a Path,
    ) -> ConvertFuture<'a>;
}

/// `qemu-img` input driver name for a source extension.
fn qemu_format(format: &str) -> Option<&'static str> {
    match format {
        "vmdk" | "ova" => Some("vmdk"),
        "vdi" => Some("vdi"),
        "vhd" => Some("vpc"),
        "vhdx" => Some("vhdx"),
        "img" | "raw" => Some("raw"),
        "qcow2" => Some("qcow2"),
        _ => None,
    }
}

/// Converts with the `qemu-img` and `tar` binaries.
pub struct QemuImgConverter {
    runner: Arc<dyn CommandRunner>,
    qemu_img: String,
    tar: String,
    timeout: Duration,
}

impl QemuImgConverter {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &IngestConfig) -> Self {
        Self {
            runner,
            qemu_img: config.qemu_img_binary.clone(),
            tar: config.tar_binary.clone(),
            timeout: Duration::from_secs(config.conversion_timeout_secs),
        }
    }

    async fn exec(&self, program: &str, args: Vec<String>) -> IngestResult<()> {
        let output = self
            .runner
            .run(program, &args, self.timeout)
            .await
            .map_err(|e| IngestError::Conversion(e.to_string()))?;
        if !output.success() {
            return Err(IngestError::Conversion(format!(
                "{program} exited with {:?}: {}",
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Unpack an OVA and return the path of its first VMDK disk.
    async fn extract_ova(&self, source: &Path, work_dir: &Path) -> IngestResult<PathBuf> {
        let extract_dir = work_dir.join("ova");
        tokio::fs::create_dir_all(&extract_dir).await?;
        self.exec(
            &self.tar,
            vec![
                "-xf".to_string(),
                source.display().to_string(),
                "-C".to_string(),
                extract_dir.display().to_string(),
            ],
        )
        .await?;

        let mut disks = Vec::new();
        let mut entries = tokio::fs::read_dir(&extract_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_vmdk = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("vmdk"));
            if is_vmdk {
                disks.push(path);
            }
        }
        disks.sort();
        disks
            .into_iter()
            .next()
            .ok_or_else(|| IngestError::Conversion("ova archive contains no vmdk disk".into()))
    }
}

impl DiskConverter for QemuImgConverter {
    fn convert<'a>(
        &'a self,
        source: &'a Path,
        format: &'a str,
        work_dir: &'a Path,
        output: &'a Path,
    ) -> ConvertFuture<'a> {
        Box::pin(async move {
            let input_format = qemu_format(format)
                .ok_or_else(|| IngestError::UnsupportedFormat(format.to_string()))?;
            let input = if format == "ova" {
                self.extract_ova(source, work_dir).await?
            } else {
                source.to_path_buf()
            };
            debug!(input = %input.display(), %input_format, "converting disk image");

            self.exec(
                &self.qemu_img,
                vec![
                    "convert".to_string(),
                    "-f".to_string(),
                    input_format.to_string(),
                    "-O".to_string(),
                    "qcow2".to_string(),
                    input.display().to_string(),
                    output.display().to_string(),
                ],
            )
            .await?;

            let size = tokio::fs::metadata(output).await?.len();
            info!(output = %output.display(), size, "disk image converted");
            Ok(size)
        })
    }
}
