use crate::core::config::RenderConfig;
use crate::core::error::{ConvertError, Result};
use crate::core::state::SpeakerAssignment;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

pub mod ladder;
pub mod pool;

/// One renderable unit of synthesis, keyed by `part_index`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub part_index: usize,
    pub text: String,
    pub voice: String,
    pub filename: String,
}

pub fn chunk_filename(part_index: usize) -> String {
    format!("chunk_{:06}.bin", part_index)
}

/// Builds the synthesis work list from final assignments, dropping fragments
/// with nothing pronounceable in them.
pub fn build_chunks(assignments: &[SpeakerAssignment]) -> Vec<Chunk> {
    assignments
        .iter()
        .filter(|a| a.text.chars().any(|c| c.is_alphanumeric()))
        .map(|a| Chunk {
            part_index: a.sentence_index,
            text: a.text.clone(),
            voice: a.voice.clone(),
            filename: chunk_filename(a.sentence_index),
        })
        .collect()
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Renders text with the given voice id into encoded audio bytes.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}

/// Signed offsets in the provider's expected `"+5Hz"` / `"-10%"` form.
fn format_offset(value: i32, unit: &str) -> String {
    format!("{}{}{}", if value >= 0 { "+" } else { "" }, value, unit)
}

#[derive(Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
    voice: &'a str,
    pitch: &'a str,
    rate: &'a str,
}

/// HTTP TTS client: text + voice id in, audio bytes out. Connections are
/// pooled by the shared reqwest client, so worker tasks reuse sockets.
pub struct HttpTtsClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    pitch: String,
    rate: String,
}

impl HttpTtsClient {
    pub fn new(render: &RenderConfig) -> Result<Self> {
        if render.tts_api_url.trim().is_empty() {
            return Err(ConvertError::Other(anyhow::anyhow!(
                "tts_api_url is not configured"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(render.tts_timeout_secs))
            .build()
            .map_err(|e| ConvertError::Other(e.into()))?;
        Ok(Self {
            client,
            api_url: render.tts_api_url.trim().to_string(),
            api_key: render.tts_api_key.trim().to_string(),
            pitch: format_offset(render.pitch, "Hz"),
            rate: format_offset(render.rate, "%"),
        })
    }
}

#[async_trait]
impl TtsClient for HttpTtsClient {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        let body = SpeakRequest {
            text,
            voice,
            pitch: &self.pitch,
            rate: &self.rate,
        };
        let mut builder = self.client.post(&self.api_url).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder.send().await.map_err(|e| {
            ConvertError::Retriable(format!("tts transport: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ConvertError::Retriable(format!(
                "tts HTTP {}: {}",
                status, detail
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConvertError::Retriable(format!("tts body: {}", e)))?;
        if bytes.is_empty() {
            return Err(ConvertError::Retriable("tts returned empty audio".into()));
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(index: usize, text: &str) -> SpeakerAssignment {
        SpeakerAssignment {
            sentence_index: index,
            text: text.to_string(),
            speaker: "narrator".to_string(),
            voice: "en-US, Guy".to_string(),
        }
    }

    #[test]
    fn chunk_filenames_are_zero_padded() {
        assert_eq!(chunk_filename(7), "chunk_000007.bin");
        assert_eq!(chunk_filename(123456), "chunk_123456.bin");
    }

    #[test]
    fn build_chunks_filters_unpronounceable() {
        let assignments = vec![
            assignment(0, "Hello there."),
            assignment(1, "***"),
            assignment(2, "—"),
            assignment(3, "Level 3"),
        ];
        let chunks = build_chunks(&assignments);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].part_index, 0);
        assert_eq!(chunks[1].part_index, 3);
        assert_eq!(chunks[1].filename, "chunk_000003.bin");
    }

    #[test]
    fn offsets_carry_signs() {
        assert_eq!(format_offset(5, "Hz"), "+5Hz");
        assert_eq!(format_offset(-12, "%"), "-12%");
        assert_eq!(format_offset(0, "Hz"), "+0Hz");
    }
}
