//! Resumable chunked uploads and the hand-off to conversion.
//!
//! Chunks are written to `{upload_dir}/{session}/chunk_{index:06}`; the
//! session row in the store records which indices have arrived. Completion
//! claims the session (`uploading` → `processing`) before reassembling, so a
//! second completion or a late chunk cannot interfere with the running
//! conversion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lab_core::SharedClock;
use lab_core::config::IngestConfig;
use labgrid_state::{
    StateError, StateStore, TemplateDraft, TemplateRequirements, UploadId, UploadSession,
    UploadStatus, VmTemplate,
};

use crate::convert::DiskConverter;
use crate::error::{IngestError, IngestResult};
use crate::registry::TemplateRegistry;

/// Parameters of a new upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitUpload {
    pub filename: String,
    pub total_size: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    /// SHA-256 of the whole file, hex.
    pub checksum: String,
    /// Template name; defaults to the file stem.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vcpu: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub disk_gb: Option<u64>,
}

/// Resume information for an upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissingChunks {
    pub upload_id: UploadId,
    pub total_chunks: u32,
    pub missing: Vec<u32>,
}

/// Result of a successful `complete_upload`.
#[derive(Debug)]
pub struct Completion {
    /// The session, now `processing`.
    pub session: UploadSession,
    /// The detached conversion task. Dropping it does not cancel it.
    pub conversion: JoinHandle<()>,
}

pub struct ImageIngestPipeline {
    store: StateStore,
    registry: TemplateRegistry,
    config: IngestConfig,
    clock: SharedClock,
    converter: Arc<dyn DiskConverter>,
}

impl ImageIngestPipeline {
    pub fn new(
        store: StateStore,
        config: IngestConfig,
        clock: SharedClock,
        converter: Arc<dyn DiskConverter>,
    ) -> Self {
        Self {
            registry: TemplateRegistry::new(store.clone()),
            store,
            config,
            clock,
            converter,
        }
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Largest chunk a session may be opened with.
    pub fn max_chunk_size(&self) -> u64 {
        self.config.max_chunk_size
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.config.upload_dir.join(id)
    }

    fn load(&self, id: &str) -> IngestResult<UploadSession> {
        self.store
            .get_upload(id)?
            .ok_or_else(|| IngestError::SessionNotFound(id.to_string()))
    }

    /// Validate the request and open a session.
    pub async fn init_upload(&self, owner: &str, req: InitUpload) -> IngestResult<UploadSession> {
        // Keep only the final path component of the client-supplied name.
        let filename = Path::new(&req.filename)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| IngestError::InvalidRequest("filename is required".into()))?;
        let format = Path::new(&filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| IngestError::UnsupportedFormat(filename.clone()))?;
        let max = *self
            .config
            .max_size_bytes
            .get(&format)
            .ok_or_else(|| IngestError::UnsupportedFormat(format.clone()))?;

        if req.total_size == 0 {
            return Err(IngestError::InvalidRequest("total_size must be positive".into()));
        }
        if req.total_size > max {
            return Err(IngestError::TooLarge {
                format,
                size: req.total_size,
                max,
            });
        }
        let chunk_size = req.chunk_size.unwrap_or(self.config.default_chunk_size);
        if chunk_size == 0 || chunk_size > self.config.max_chunk_size {
            return Err(IngestError::InvalidRequest(format!(
                "chunk_size must be between 1 and {}",
                self.config.max_chunk_size
            )));
        }
        let total_chunks = UploadSession::chunk_count(req.total_size, chunk_size)
            .filter(|n| *n <= self.config.max_chunks)
            .ok_or_else(|| {
                IngestError::InvalidRequest(format!(
                    "upload would need more than {} chunks; use a larger chunk_size",
                    self.config.max_chunks
                ))
            })?;
        let checksum = normalize_checksum(&req.checksum)?;

        let now = self.clock.now_secs();
        let stem = Path::new(&filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("template")
            .to_string();
        let session = UploadSession {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            format,
            total_size: req.total_size,
            chunk_size,
            total_chunks,
            received: Default::default(),
            checksum,
            status: UploadStatus::Uploading,
            template: TemplateDraft {
                name: req.name.unwrap_or(stem),
                requirements: TemplateRequirements {
                    vcpu: req.vcpu.unwrap_or(self.config.default_vcpu),
                    memory_mb: req.memory_mb.unwrap_or(self.config.default_memory_mb),
                    disk_gb: req.disk_gb.unwrap_or(self.config.default_disk_gb),
                },
            },
            filename,
            template_id: None,
            error: None,
            created_at: now,
            expires_at: now + self.config.session_ttl_secs,
        };

        tokio::fs::create_dir_all(self.session_dir(&session.id)).await?;
        self.store.put_upload(&session)?;
        info!(
            upload_id = %session.id,
            %owner,
            filename = %session.filename,
            total_size = session.total_size,
            total_chunks = session.total_chunks,
            "upload session opened"
        );
        Ok(session)
    }

    /// Store one chunk. Re-sending an index overwrites it.
    pub async fn upload_chunk(&self, id: &str, index: u32, data: &[u8]) -> IngestResult<UploadSession> {
        let session = self.load(id)?;
        if session.status != UploadStatus::Uploading {
            return Err(IngestError::InvalidStatus {
                id: id.to_string(),
                status: session.status,
            });
        }
        if self.clock.now_secs() >= session.expires_at {
            return Err(IngestError::SessionExpired(id.to_string()));
        }
        let expected = session
            .expected_chunk_len(index)
            .ok_or(IngestError::InvalidChunkIndex {
                index,
                total: session.total_chunks,
            })?;
        if data.len() as u64 != expected {
            return Err(IngestError::ChunkSizeMismatch {
                index,
                expected,
                actual: data.len() as u64,
            });
        }

        // Write beside the final name, then rename into place.
        let path = chunk_path(&self.session_dir(id), index);
        let partial = path.with_extension("part");
        tokio::fs::write(&partial, data).await?;
        tokio::fs::rename(&partial, &path).await?;

        let update = self.store.update_upload(id, |s| {
            s.status == UploadStatus::Uploading && s.received.insert(index)
        })?;
        let session = update.into_inner();
        if session.status != UploadStatus::Uploading {
            return Err(IngestError::InvalidStatus {
                id: id.to_string(),
                status: session.status,
            });
        }
        debug!(
            upload_id = %id,
            index,
            received = session.received.len(),
            total = session.total_chunks,
            "chunk stored"
        );
        Ok(session)
    }

    /// Indices not yet received, ascending.
    pub fn missing_chunks(&self, id: &str) -> IngestResult<MissingChunks> {
        let session = self.load(id)?;
        Ok(MissingChunks {
            upload_id: session.id.clone(),
            total_chunks: session.total_chunks,
            missing: session.missing_chunks(),
        })
    }

    /// Current session state, for polling a running conversion.
    pub fn status(&self, id: &str) -> IngestResult<UploadSession> {
        self.load(id)
    }

    /// Verify the upload and start converting it in the background.
    ///
    /// A missing chunk leaves the session `uploading` so the client can
    /// resume; a checksum mismatch fails it and discards the chunks.
    pub async fn complete_upload(&self, id: &str) -> IngestResult<Completion> {
        let session = self.load(id)?;
        if session.status != UploadStatus::Uploading {
            return Err(IngestError::InvalidStatus {
                id: id.to_string(),
                status: session.status,
            });
        }
        if self.clock.now_secs() >= session.expires_at {
            return Err(IngestError::SessionExpired(id.to_string()));
        }

        // Claim the session so concurrent completions and late chunks lose.
        let claim = self.store.update_upload(id, |s| {
            if s.status != UploadStatus::Uploading || !s.is_complete() {
                return false;
            }
            s.status = UploadStatus::Processing;
            true
        })?;
        if !claim.is_applied() {
            let current = claim.into_inner();
            if current.status != UploadStatus::Uploading {
                return Err(IngestError::InvalidStatus {
                    id: id.to_string(),
                    status: current.status,
                });
            }
            let missing = current.missing_chunks().len() as u32;
            debug!(upload_id = %id, missing, "completion refused, chunks missing");
            return Err(IngestError::IncompleteUpload { missing });
        }
        let session = claim.into_inner();

        let dir = self.session_dir(id);
        let source = dir.join(format!("source.{}", session.format));
        let digest = match reassemble(&dir, &source, session.total_chunks).await {
            Ok(digest) => digest,
            Err(e) => {
                self.fail(id, &e.to_string());
                remove_dir(&dir).await;
                return Err(e);
            }
        };

        if digest != session.checksum {
            let err = IngestError::ChecksumMismatch {
                expected: session.checksum.clone(),
                actual: digest,
            };
            warn!(upload_id = %id, error = %err, "upload failed integrity check");
            self.fail(id, &err.to_string());
            remove_dir(&dir).await;
            return Err(err);
        }

        info!(upload_id = %id, format = %session.format, "upload verified, converting");
        let job = ConversionJob {
            store: self.store.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            converter: self.converter.clone(),
            template_dir: self.config.template_dir.clone(),
            session_dir: dir,
            source,
            session: session.clone(),
        };
        let conversion = tokio::spawn(job.run());
        Ok(Completion {
            session,
            conversion,
        })
    }

    /// Fail `uploading` sessions past their abandon-expiry and delete their
    /// chunks. Returns the number of sessions expired.
    pub async fn expire_sessions(&self, now: u64) -> IngestResult<u32> {
        let mut expired = 0;
        for session in self.store.list_uploads()? {
            if session.status != UploadStatus::Uploading || now < session.expires_at {
                continue;
            }
            let update = self.store.update_upload(&session.id, |s| {
                if s.status != UploadStatus::Uploading {
                    return false;
                }
                s.status = UploadStatus::Failed;
                s.error = Some("upload session expired".to_string());
                true
            })?;
            if update.is_applied() {
                remove_dir(&self.session_dir(&session.id)).await;
                info!(upload_id = %session.id, "abandoned upload expired");
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Fail sessions left `processing` by a previous process; their
    /// conversion task no longer exists.
    pub async fn recover_interrupted(&self) -> IngestResult<u32> {
        let mut recovered = 0;
        for session in self.store.list_uploads()? {
            if session.status != UploadStatus::Processing {
                continue;
            }
            self.fail(&session.id, "conversion interrupted by restart");
            remove_dir(&self.session_dir(&session.id)).await;
            recovered += 1;
        }
        if recovered > 0 {
            warn!(recovered, "failed uploads interrupted mid-conversion");
        }
        Ok(recovered)
    }

    fn fail(&self, id: &str, message: &str) {
        mark_failed(&self.store, id, message);
    }
}

fn mark_failed(store: &StateStore, id: &str, message: &str) {
    let result = store.update_upload(id, |s| {
        if matches!(s.status, UploadStatus::Completed | UploadStatus::Failed) {
            return false;
        }
        s.status = UploadStatus::Failed;
        s.error = Some(message.to_string());
        true
    });
    if let Err(e) = result {
        error!(upload_id = %id, error = %e, "failed to record upload failure");
    }
}

fn chunk_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("chunk_{index:06}"))
}

fn normalize_checksum(raw: &str) -> IngestResult<String> {
    let checksum = raw.trim().to_ascii_lowercase();
    if checksum.len() != 64 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IngestError::InvalidRequest(
            "checksum must be 64 hex characters (sha256)".into(),
        ));
    }
    Ok(checksum)
}

/// Concatenate chunks in index order into `target`, returning the SHA-256
/// of the result as lowercase hex.
async fn reassemble(dir: &Path, target: &Path, total_chunks: u32) -> IngestResult<String> {
    let mut file = tokio::fs::File::create(target).await?;
    let mut hasher = Sha256::new();
    for index in 0..total_chunks {
        let chunk = tokio::fs::read(chunk_path(dir, index)).await?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(hex::encode(hasher.finalize()))
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove upload directory"),
    }
}

/// Detached conversion of one verified upload.
struct ConversionJob {
    store: StateStore,
    registry: TemplateRegistry,
    clock: SharedClock,
    converter: Arc<dyn DiskConverter>,
    template_dir: PathBuf,
    session_dir: PathBuf,
    source: PathBuf,
    session: UploadSession,
}

impl ConversionJob {
    async fn run(self) {
        let upload_id = self.session.id.clone();
        let template_id = uuid::Uuid::new_v4().to_string();
        let output = self.template_dir.join(format!("{template_id}.qcow2"));

        match self.convert_and_register(&template_id, &output).await {
            Ok(()) => info!(%upload_id, %template_id, "upload converted into template"),
            Err(e) => {
                error!(%upload_id, error = %e, "image conversion failed");
                if let Err(rm) = tokio::fs::remove_file(&output).await
                    && rm.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(output = %output.display(), error = %rm, "failed to remove partial output");
                }
                mark_failed(&self.store, &upload_id, &e.to_string());
            }
        }
        remove_dir(&self.session_dir).await;
    }

    async fn convert_and_register(&self, template_id: &str, output: &Path) -> IngestResult<()> {
        tokio::fs::create_dir_all(&self.template_dir).await?;
        let size_bytes = self
            .converter
            .convert(&self.source, &self.session.format, &self.session_dir, output)
            .await?;

        let template = VmTemplate {
            id: template_id.to_string(),
            name: self.session.template.name.clone(),
            disk_path: output.display().to_string(),
            disk_format: "qcow2".to_string(),
            size_bytes,
            requirements: self.session.template.requirements,
            active: true,
            source_upload: Some(self.session.id.clone()),
            created_at: self.clock.now_secs(),
        };
        self.registry.register(&template)?;

        let update = self.store.update_upload(&self.session.id, |s| {
            if s.status != UploadStatus::Processing {
                return false;
            }
            s.status = UploadStatus::Completed;
            s.template_id = Some(template_id.to_string());
            true
        });
        match update {
            Ok(u) if u.is_applied() => Ok(()),
            Ok(u) => Err(IngestError::InvalidStatus {
                id: self.session.id.clone(),
                status: u.into_inner().status,
            }),
            Err(StateError::NotFound(id)) => Err(IngestError::SessionNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}
