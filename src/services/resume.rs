use crate::core::config::OrchestratorInput;
use crate::core::error::{ConvertError, Result};
use crate::core::io::Storage;
use crate::core::state::{JobSignature, PipelineState};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const TEMP_DIR_NAME: &str = "_temp_work";
const STATE_FILE: &str = "pipeline_state.json";
const SIGNATURE_FILE: &str = "job_signature.json";

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Fingerprints the input text and every setting that changes rendered chunk
/// bytes. A mismatch on any of these invalidates the chunk cache.
pub fn compute_signature(input: &OrchestratorInput) -> JobSignature {
    let settings = serde_json::json!({
        "narrator_voice": input.render.narrator_voice,
        "voice": input.render.voice,
        "pitch": input.render.pitch,
        "rate": input.render.rate,
        "enabled_voices": input.render.enabled_voices.iter().map(|v| &v.id).collect::<Vec<_>>(),
        "language": input.language,
        "dictionary": input.dictionary,
        "lexx_register": input.render.lexx_register,
        "audio": {
            "silence_removal": input.audio.silence_removal,
            "normalization": input.audio.normalization,
            "de_ess": input.audio.de_ess,
            "silence_gap_ms": input.audio.silence_gap_ms,
            "eq": input.audio.eq,
            "compressor": input.audio.compressor,
            "fade_in": input.audio.fade_in,
            "stereo_width": input.audio.stereo_width,
            "opus_min_bitrate": input.audio.opus_min_bitrate,
            "opus_max_bitrate": input.audio.opus_max_bitrate,
            "opus_compression_level": input.audio.opus_compression_level,
        },
    });
    JobSignature {
        text_sha256: sha256_hex(input.text.as_bytes()),
        settings_sha256: sha256_hex(settings.to_string().as_bytes()),
    }
}

/// Owns `_temp_work` for one conversion: signature check, pipeline-state
/// persistence and purging.
pub struct ResumeLayer {
    temp_dir: PathBuf,
}

impl ResumeLayer {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            temp_dir: output_dir.join(TEMP_DIR_NAME),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.temp_dir.join("logs")
    }

    fn state_path(&self) -> PathBuf {
        self.temp_dir.join(STATE_FILE)
    }

    fn signature_path(&self) -> PathBuf {
        self.temp_dir.join(SIGNATURE_FILE)
    }

    pub async fn has_pipeline_state(&self, storage: &dyn Storage) -> bool {
        storage.exists(&self.state_path()).await.unwrap_or(false)
    }

    /// True when a previous run left a signature that matches this input.
    pub async fn signature_matches(
        &self,
        storage: &dyn Storage,
        signature: &JobSignature,
    ) -> bool {
        match storage.read_to_string(&self.signature_path()).await {
            Ok(content) => match serde_json::from_str::<JobSignature>(&content) {
                Ok(stored) => stored == *signature,
                Err(e) => {
                    log::warn!("stored job signature unreadable: {}", e);
                    false
                }
            },
            Err(_) => false,
        }
    }

    pub async fn save_signature(
        &self,
        storage: &dyn Storage,
        signature: &JobSignature,
    ) -> Result<()> {
        let content = serde_json::to_string_pretty(signature)
            .map_err(|e| ConvertError::Other(e.into()))?;
        storage.write(&self.signature_path(), content.as_bytes()).await
    }

    pub async fn load_state(&self, storage: &dyn Storage) -> Result<Option<PipelineState>> {
        if !self.has_pipeline_state(storage).await {
            return Ok(None);
        }
        let content = storage.read_to_string(&self.state_path()).await?;
        match serde_json::from_str::<PipelineState>(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                log::warn!("pipeline state unreadable, ignoring: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn save_state(&self, storage: &dyn Storage, state: &PipelineState) -> Result<()> {
        let content =
            serde_json::to_string_pretty(state).map_err(|e| ConvertError::Other(e.into()))?;
        storage.write(&self.state_path(), content.as_bytes()).await
    }

    pub async fn purge(&self, storage: &dyn Storage) -> Result<()> {
        storage.delete(&self.temp_dir).await
    }
}
