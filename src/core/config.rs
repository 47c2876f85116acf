use crate::core::state::Gender;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-stage LLM endpoint settings. One block each for extract, merge and
/// assign so heavier models can be reserved for the stages that need them.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LlmStageConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_true")]
    pub reasoning: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub repeat_prompt: bool,
}

impl LlmStageConfig {
    /// Minimum configuration for a chat call. The key may stay empty for
    /// unauthenticated local endpoints.
    pub fn is_configured(&self) -> bool {
        !self.api_url.trim().is_empty() && !self.model.trim().is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LlmConfig {
    pub extract: LlmStageConfig,
    pub merge: LlmStageConfig,
    pub assign: LlmStageConfig,
    #[serde(default = "default_true")]
    pub use_voting: bool,
    #[serde(default = "default_llm_threads")]
    pub llm_threads: usize,
    #[serde(default = "default_block_tokens")]
    pub max_block_tokens: usize,
}

/// One enabled voice. Ids are opaque `"<locale>, <name>"` strings; gender is
/// carried alongside because the id alone does not encode it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VoiceDef {
    pub id: String,
    #[serde(default)]
    pub gender: Gender,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RenderConfig {
    pub narrator_voice: String,
    /// Fallback voice when a speaker resolves to nothing.
    pub voice: String,
    /// Pitch offset in Hz, signed.
    #[serde(default)]
    pub pitch: i32,
    /// Rate offset in percent, signed.
    #[serde(default)]
    pub rate: i32,
    #[serde(default = "default_tts_threads")]
    pub tts_threads: usize,
    #[serde(default)]
    pub enabled_voices: Vec<VoiceDef>,
    /// Dictionary rules match case-sensitively when set.
    #[serde(default)]
    pub lexx_register: bool,
    #[serde(default)]
    pub tts_api_url: String,
    #[serde(default)]
    pub tts_api_key: String,
    #[serde(default = "default_tts_timeout")]
    pub tts_timeout_secs: u64,
    #[serde(default = "default_task_retries")]
    pub tts_task_retries: u32,
    #[serde(default)]
    pub ladder: LadderConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            narrator_voice: String::new(),
            voice: String::new(),
            pitch: 0,
            rate: 0,
            tts_threads: default_tts_threads(),
            enabled_voices: Vec::new(),
            lexx_register: false,
            tts_api_url: String::new(),
            tts_api_key: String::new(),
            tts_timeout_secs: default_tts_timeout(),
            tts_task_retries: default_task_retries(),
            ladder: LadderConfig::default(),
        }
    }
}

/// Adaptive worker-pool controller settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LadderConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    #[serde(default = "default_scale_down_factor")]
    pub scale_down_factor: f64,
    #[serde(default = "default_scale_up_increment")]
    pub scale_up_increment: usize,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            sample_size: default_sample_size(),
            success_threshold: default_success_threshold(),
            scale_down_factor: default_scale_down_factor(),
            scale_up_increment: default_scale_up_increment(),
        }
    }
}

/// Audio post-processing toggles and Opus encode settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default)]
    pub silence_removal: bool,
    #[serde(default = "default_true")]
    pub normalization: bool,
    #[serde(default)]
    pub de_ess: bool,
    #[serde(default = "default_silence_gap")]
    pub silence_gap_ms: u32,
    #[serde(default)]
    pub eq: bool,
    #[serde(default)]
    pub compressor: bool,
    #[serde(default)]
    pub fade_in: bool,
    #[serde(default)]
    pub stereo_width: bool,
    #[serde(default = "default_opus_min")]
    pub opus_min_bitrate: u32,
    #[serde(default = "default_opus_max")]
    pub opus_max_bitrate: u32,
    #[serde(default = "default_opus_level")]
    pub opus_compression_level: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            silence_removal: false,
            normalization: true,
            de_ess: false,
            silence_gap_ms: default_silence_gap(),
            eq: false,
            compressor: false,
            fade_in: false,
            stereo_width: false,
            opus_min_bitrate: default_opus_min(),
            opus_max_bitrate: default_opus_max(),
            opus_compression_level: default_opus_level(),
        }
    }
}

/// Everything one conversion job needs, assembled by the shell.
#[derive(Debug, Clone)]
pub struct OrchestratorInput {
    pub llm: LlmConfig,
    pub render: RenderConfig,
    pub audio: AudioConfig,
    pub output_dir: PathBuf,
    /// Two-letter detected book language.
    pub language: String,
    pub dictionary: Vec<String>,
    pub text: String,
    pub book_name: String,
}

/// On-disk `config.yml` for the CLI shell.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_file: String,
    #[serde(default = "default_output")]
    pub output_folder: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub dictionary_file: Option<String>,
    pub llm: LlmConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

fn default_input() -> String {
    "input/book.txt".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.2
}
fn default_top_p() -> f32 {
    0.95
}
fn default_llm_threads() -> usize {
    2
}
fn default_block_tokens() -> usize {
    4000
}
fn default_tts_threads() -> usize {
    8
}
fn default_tts_timeout() -> u64 {
    60
}
fn default_task_retries() -> u32 {
    4
}
fn default_min_workers() -> usize {
    2
}
fn default_sample_size() -> usize {
    10
}
fn default_success_threshold() -> f64 {
    0.8
}
fn default_scale_down_factor() -> f64 {
    0.5
}
fn default_scale_up_increment() -> usize {
    1
}
fn default_silence_gap() -> u32 {
    500
}
fn default_opus_min() -> u32 {
    32_000
}
fn default_opus_max() -> u32 {
    64_000
}
fn default_opus_level() -> u32 {
    10
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Derives the book name from the input file stem.
    pub fn book_name(&self) -> String {
        Path::new(&self.input_file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "book".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_parses_with_defaults() {
        let yaml = r#"
llm:
  extract:
    api_url: "http://localhost:1234/v1"
    model: "test"
  merge:
    api_url: "http://localhost:1234/v1"
    model: "test"
  assign:
    api_url: "http://localhost:1234/v1"
    model: "test"
"#;
        let cfg: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(cfg.output_folder, "output");
        assert!(cfg.llm.use_voting);
        assert_eq!(cfg.llm.llm_threads, 2);
        assert_eq!(cfg.render.ladder.min_workers, 2);
        assert_eq!(cfg.audio.silence_gap_ms, 500);
        assert!(cfg.llm.extract.is_configured());
        assert!(!cfg.llm.extract.streaming);
    }

    #[test]
    fn stage_without_model_is_unconfigured() {
        let stage = LlmStageConfig {
            api_url: "http://x".into(),
            ..Default::default()
        };
        assert!(!stage.is_configured());
    }

    #[test]
    fn book_name_from_input_stem() {
        let mut cfg: Config = serde_yaml_ng::from_str("llm: {extract: {}, merge: {}, assign: {}}")
            .unwrap();
        cfg.input_file = "books/The Long Way.txt".into();
        assert_eq!(cfg.book_name(), "The Long Way");
    }
}
