use crate::core::config::AudioConfig;
use crate::core::error::{ConvertError, Result};
use crate::core::state::FileBoundary;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Seam between the orchestrator and the encoder so a crashed instance can
/// be replaced wholesale.
#[async_trait]
pub trait SegmentEncoder: Send {
    async fn merge_segment(
        &mut self,
        plan: &SegmentPlan,
        chunk_dir: &Path,
        out_dir: &Path,
    ) -> Result<PathBuf>;
}

/// The encoder workspace is recreated after this many merges to bound the
/// disk footprint of accumulated intermediates.
pub const MAX_OPERATIONS_BEFORE_REFRESH: usize = 8;

/// Chunks arrive from the TTS provider at this rate; the silence filler must
/// match or the concat demuxer drifts.
const CHUNK_SAMPLE_RATE: u32 = 24_000;

/// Fixed output rate for the Opus encode.
const OUTPUT_SAMPLE_RATE: u32 = 48_000;

/// One output file: a contiguous slice of the assignment stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub label: String,
    pub first_sentence: usize,
    pub end_sentence: usize,
}

/// Derives per-file segments from the boundary list. Boundaries must be
/// sorted by first sentence; empty slices are dropped.
pub fn plan_segments(boundaries: &[FileBoundary], total_sentences: usize) -> Vec<SegmentPlan> {
    let mut plans = Vec::new();
    for (i, b) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(i + 1)
            .map(|n| n.first_sentence)
            .unwrap_or(total_sentences);
        if b.first_sentence < end {
            plans.push(SegmentPlan {
                label: b.label.clone(),
                first_sentence: b.first_sentence,
                end_sentence: end,
            });
        }
    }
    plans
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderState {
    Uninitialised,
    Loaded,
    InUse,
    Terminated,
}

/// Builds the single `-af` argument from the enabled filters, in fixed
/// order. Returns None when every filter is off.
pub fn build_filter_chain(audio: &AudioConfig) -> Option<String> {
    let mut filters: Vec<String> = Vec::new();
    if audio.silence_removal {
        filters.push(
            "silenceremove=start_periods=1:stop_periods=-1:stop_duration=0.6:stop_threshold=-45dB"
                .to_string(),
        );
    }
    if audio.normalization {
        filters.push("loudnorm=I=-18:TP=-2:LRA=11".to_string());
    }
    if audio.de_ess {
        filters.push("deesser".to_string());
    }
    if audio.eq {
        filters.push("highpass=f=80,treble=g=2".to_string());
    }
    if audio.compressor {
        filters.push("acompressor=threshold=-18dB:ratio=3:attack=20:release=250".to_string());
    }
    if audio.fade_in {
        filters.push("afade=t=in:st=0:d=0.5".to_string());
    }
    if audio.stereo_width {
        filters.push("extrastereo=m=1.25".to_string());
    }
    if filters.is_empty() {
        None
    } else {
        Some(filters.join(","))
    }
}

/// Concat list alternating chunk and silence entries. A missing chunk index
/// is replaced by the silence clip so the output stays time-aligned.
pub fn build_concat_list(
    plan: &SegmentPlan,
    available: impl Fn(usize) -> Option<PathBuf>,
    silence: &Path,
) -> String {
    let mut lines = Vec::new();
    for index in plan.first_sentence..plan.end_sentence {
        match available(index) {
            Some(path) => lines.push(format!("file '{}'", path.display())),
            None => lines.push(format!("file '{}'", silence.display())),
        }
        lines.push(format!("file '{}'", silence.display()));
    }
    lines.join("\n")
}

/// FFmpeg wrapper treating the binary as a scoped encoder instance: a
/// private workspace is acquired on load, all inputs are staged inside it,
/// and nothing but the final output blob leaves the scope.
pub struct AudioMerger {
    audio: AudioConfig,
    ffmpeg: String,
    state: EncoderState,
    workspace: Option<tempfile::TempDir>,
    operations: usize,
}

impl AudioMerger {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            audio: audio.clone(),
            ffmpeg: "ffmpeg".to_string(),
            state: EncoderState::Uninitialised,
            workspace: None,
            operations: 0,
        }
    }

    /// Probes the encoder binary and acquires a fresh workspace.
    pub async fn load(&mut self) -> Result<()> {
        let probe = Command::new(&self.ffmpeg)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                ConvertError::EncoderFatal(format!("ffmpeg not available: {}", e))
            })?;
        if !probe.success() {
            return Err(ConvertError::EncoderFatal(format!(
                "ffmpeg probe exited with {}",
                probe
            )));
        }
        self.workspace = Some(
            tempfile::tempdir().map_err(|e| {
                ConvertError::EncoderFatal(format!("cannot create encoder workspace: {}", e))
            })?,
        );
        self.operations = 0;
        self.state = EncoderState::Loaded;
        Ok(())
    }

    /// Drops the workspace. The next merge must load again.
    pub fn terminate(&mut self) {
        self.workspace = None;
        self.state = EncoderState::Terminated;
    }

    async fn ensure_ready(&mut self) -> Result<()> {
        match self.state {
            EncoderState::Uninitialised | EncoderState::Terminated => self.load().await,
            EncoderState::Loaded => {
                if self.operations >= MAX_OPERATIONS_BEFORE_REFRESH {
                    log::debug!("refreshing encoder workspace after {} merges", self.operations);
                    self.load().await
                } else {
                    Ok(())
                }
            }
            EncoderState::InUse => Err(ConvertError::EncoderFatal(
                "encoder re-entered while in use".to_string(),
            )),
        }
    }

    async fn run_ffmpeg(&self, args: &[String]) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConvertError::EncoderFatal(format!("ffmpeg spawn: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(6)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(ConvertError::EncoderFatal(format!(
                "ffmpeg exited with {}: {}",
                output.status, tail
            )));
        }
        Ok(())
    }

    async fn merge_segment_impl(
        &mut self,
        plan: &SegmentPlan,
        chunk_dir: &Path,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        self.ensure_ready().await?;
        self.state = EncoderState::InUse;
        match self.merge_inner(plan, chunk_dir, out_dir).await {
            Ok(path) => {
                self.operations += 1;
                self.state = EncoderState::Loaded;
                Ok(path)
            }
            Err(e) => {
                self.terminate();
                Err(e)
            }
        }
    }

    async fn merge_inner(
        &self,
        plan: &SegmentPlan,
        chunk_dir: &Path,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        let workspace = self
            .workspace
            .as_ref()
            .ok_or_else(|| ConvertError::EncoderFatal("workspace missing".to_string()))?
            .path()
            .to_path_buf();

        // Silence filler at the chunk rate, regenerated per merge so a
        // workspace refresh cannot orphan it.
        let silence = workspace.join("silence.mp3");
        let gap_secs = f64::from(self.audio.silence_gap_ms) / 1000.0;
        self.run_ffmpeg(&[
            "-y".into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("anullsrc=r={}:cl=mono", CHUNK_SAMPLE_RATE),
            "-t".into(),
            format!("{:.3}", gap_secs.max(0.05)),
            "-c:a".into(),
            "libmp3lame".into(),
            "-q:a".into(),
            "9".into(),
            silence.display().to_string(),
        ])
        .await?;

        // Stage every cached chunk under a deterministic workspace name.
        let mut staged: std::collections::HashMap<usize, PathBuf> =
            std::collections::HashMap::new();
        for index in plan.first_sentence..plan.end_sentence {
            let source = chunk_dir.join(crate::services::tts::chunk_filename(index));
            match tokio::fs::metadata(&source).await {
                Ok(meta) if meta.len() > 0 => {
                    let dest = workspace.join(format!("part_{:06}.mp3", index));
                    tokio::fs::copy(&source, &dest).await.map_err(|e| {
                        ConvertError::EncoderFatal(format!("staging chunk {}: {}", index, e))
                    })?;
                    staged.insert(index, dest);
                }
                _ => {}
            }
        }

        let list = build_concat_list(plan, |i| staged.get(&i).cloned(), &silence);
        let list_path = workspace.join("concat.txt");
        tokio::fs::write(&list_path, list)
            .await
            .map_err(|e| ConvertError::EncoderFatal(format!("concat list: {}", e)))?;

        let encoded = workspace.join("segment.opus");
        let channels = if self.audio.stereo_width { "2" } else { "1" };
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.display().to_string(),
        ];
        if let Some(chain) = build_filter_chain(&self.audio) {
            args.push("-af".into());
            args.push(chain);
        }
        args.extend([
            "-c:a".into(),
            "libopus".into(),
            "-vbr".into(),
            "on".into(),
            "-b:a".into(),
            self.audio.opus_max_bitrate.to_string(),
            "-minrate".into(),
            self.audio.opus_min_bitrate.to_string(),
            "-maxrate".into(),
            self.audio.opus_max_bitrate.to_string(),
            "-compression_level".into(),
            self.audio.opus_compression_level.to_string(),
            "-ac".into(),
            channels.into(),
            "-ar".into(),
            OUTPUT_SAMPLE_RATE.to_string(),
            encoded.display().to_string(),
        ]);
        self.run_ffmpeg(&args).await?;

        let target_dir = out_dir.join(&plan.label);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| ConvertError::EncoderFatal(format!("output dir: {}", e)))?;
        let target = target_dir.join(format!("{}.opus", plan.label));
        tokio::fs::copy(&encoded, &target)
            .await
            .map_err(|e| ConvertError::EncoderFatal(format!("publishing output: {}", e)))?;
        Ok(target)
    }
}

#[async_trait]
impl SegmentEncoder for AudioMerger {
    /// Merges one segment into `<out_dir>/<label>/<label>.opus`. On failure
    /// the workspace is torn down and the encoder must be reloaded; the
    /// caller decides whether to retry with a fresh instance.
    async fn merge_segment(
        &mut self,
        plan: &SegmentPlan,
        chunk_dir: &Path,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        self.merge_segment_impl(plan, chunk_dir, out_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary(label: &str, first: usize) -> FileBoundary {
        FileBoundary {
            label: label.to_string(),
            first_sentence: first,
        }
    }

    #[test]
    fn segments_cover_the_stream() {
        let plans = plan_segments(
            &[boundary("Chapter 1", 0), boundary("Chapter 2", 10)],
            25,
        );
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].first_sentence, 0);
        assert_eq!(plans[0].end_sentence, 10);
        assert_eq!(plans[1].end_sentence, 25);
    }

    #[test]
    fn empty_segments_are_dropped() {
        let plans = plan_segments(
            &[boundary("A", 0), boundary("B", 0), boundary("C", 4)],
            4,
        );
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].label, "B");
        assert_eq!(plans[1].label, "C");
    }

    #[test]
    fn filter_chain_fixed_order() {
        let audio = AudioConfig {
            silence_removal: true,
            normalization: true,
            de_ess: false,
            eq: true,
            compressor: true,
            fade_in: true,
            stereo_width: true,
            ..Default::default()
        };
        let chain = build_filter_chain(&audio).unwrap();
        let silence_pos = chain.find("silenceremove").unwrap();
        let norm_pos = chain.find("loudnorm").unwrap();
        let eq_pos = chain.find("highpass").unwrap();
        let comp_pos = chain.find("acompressor").unwrap();
        let fade_pos = chain.find("afade").unwrap();
        let stereo_pos = chain.find("extrastereo").unwrap();
        assert!(silence_pos < norm_pos);
        assert!(norm_pos < eq_pos);
        assert!(eq_pos < comp_pos);
        assert!(comp_pos < fade_pos);
        assert!(fade_pos < stereo_pos);
        assert!(!chain.contains("deesser"));
    }

    #[test]
    fn all_filters_off_yields_none() {
        let audio = AudioConfig {
            normalization: false,
            ..Default::default()
        };
        assert!(build_filter_chain(&audio).is_none());
    }

    #[test]
    fn concat_list_substitutes_silence_for_missing() {
        let plan = SegmentPlan {
            label: "x".to_string(),
            first_sentence: 0,
            end_sentence: 3,
        };
        let silence = PathBuf::from("/ws/silence.mp3");
        let list = build_concat_list(
            &plan,
            |i| {
                if i == 1 {
                    None
                } else {
                    Some(PathBuf::from(format!("/ws/part_{:06}.mp3", i)))
                }
            },
            &silence,
        );
        let lines: Vec<&str> = list.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "file '/ws/part_000000.mp3'");
        assert_eq!(lines[1], "file '/ws/silence.mp3'");
        // Missing chunk 1 becomes silence, keeping the timeline aligned.
        assert_eq!(lines[2], "file '/ws/silence.mp3'");
        assert_eq!(lines[4], "file '/ws/part_000002.mp3'");
    }

    #[test]
    fn encoder_state_machine() {
        let mut merger = AudioMerger::new(&AudioConfig::default());
        assert_eq!(merger.state, EncoderState::Uninitialised);
        merger.terminate();
        assert_eq!(merger.state, EncoderState::Terminated);
        assert!(merger.workspace.is_none());
    }
}
