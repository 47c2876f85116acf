use crate::core::config::OrchestratorInput;
use crate::core::error::{ConvertError, Result};
use crate::core::io::Storage;
use crate::core::progress::{LogSink, ProgressEvent, ProgressSink, Stage};
use crate::core::state::{Character, PipelineState, SpeakerAssignment};
use crate::services::analysis::AnalysisPipeline;
use crate::services::llm::LlmClient;
use crate::services::merger::{plan_segments, SegmentEncoder};
use crate::services::profile;
use crate::services::resume::{compute_signature, ResumeLayer};
use crate::services::sanitize::{sanitize_text, Dictionary};
use crate::services::splitter::{detect_file_boundaries, split_blocks, split_paragraphs};
use crate::services::tts::pool::render_chunks;
use crate::services::tts::{build_chunks, TtsClient};
use crate::services::voices::{allocate_by_frequency, allocate_by_gender, VoicePool};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Asks the caller whether a matching previous session should be resumed.
#[async_trait]
pub trait ResumePrompt: Send + Sync {
    async fn confirm_resume(&self) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub characters: Vec<Character>,
    pub voice_map: HashMap<String, String>,
    pub assignments: Vec<SpeakerAssignment>,
}

#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub voice_map: HashMap<String, String>,
}

/// The voice-review pause. The outcome may carry a different voice map than
/// the request if the user edited voices.
#[async_trait]
pub trait VoiceReviewer: Send + Sync {
    async fn review(&self, request: ReviewRequest) -> Result<ReviewOutcome>;
}

/// Accepts everything; used by unattended runs.
pub struct AutoAccept;

#[async_trait]
impl ResumePrompt for AutoAccept {
    async fn confirm_resume(&self) -> Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl VoiceReviewer for AutoAccept {
    async fn review(&self, request: ReviewRequest) -> Result<ReviewOutcome> {
        Ok(ReviewOutcome {
            voice_map: request.voice_map,
        })
    }
}

pub struct LlmClients {
    pub extract: Box<dyn LlmClient>,
    pub merge: Box<dyn LlmClient>,
    pub assign: Box<dyn LlmClient>,
}

pub type EncoderFactory = Box<dyn Fn() -> Box<dyn SegmentEncoder> + Send + Sync>;

#[derive(Debug)]
pub struct ConversionReport {
    pub outputs: Vec<PathBuf>,
    pub characters: usize,
    pub chunks_rendered: usize,
    pub chunks_failed: usize,
    pub resumed: bool,
}

/// Speaking-line counts per character canonical name, narrator excluded.
pub fn count_lines(assignments: &[SpeakerAssignment]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for a in assignments {
        if !a.is_narrator() {
            *counts.entry(a.speaker.clone()).or_insert(0) += 1;
        }
    }
    counts
}

fn apply_voices(
    assignments: &mut [SpeakerAssignment],
    voice_map: &HashMap<String, String>,
    narrator_voice: &str,
    fallback_voice: &str,
) {
    for a in assignments.iter_mut() {
        a.voice = if a.is_narrator() {
            narrator_voice.to_string()
        } else {
            voice_map.get(&a.speaker).cloned().unwrap_or_else(|| {
                if fallback_voice.is_empty() {
                    narrator_voice.to_string()
                } else {
                    fallback_voice.to_string()
                }
            })
        };
    }
}

/// The conversion orchestrator: a single resumable async job running the
/// phases of the pipeline in order. Only this type mutates externally
/// visible status.
pub struct ConversionJob {
    input: OrchestratorInput,
    llm: LlmClients,
    tts: Arc<dyn TtsClient>,
    storage: Arc<dyn Storage>,
    encoder_factory: EncoderFactory,
    progress: Arc<dyn ProgressSink>,
    resume_prompt: Arc<dyn ResumePrompt>,
    reviewer: Arc<dyn VoiceReviewer>,
    cancel: CancellationToken,
}

impl ConversionJob {
    pub fn new(
        input: OrchestratorInput,
        llm: LlmClients,
        tts: Arc<dyn TtsClient>,
        storage: Arc<dyn Storage>,
        encoder_factory: EncoderFactory,
    ) -> Self {
        Self {
            input,
            llm,
            tts,
            storage,
            encoder_factory,
            progress: Arc::new(LogSink),
            resume_prompt: Arc::new(AutoAccept),
            reviewer: Arc::new(AutoAccept),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_resume_prompt(mut self, prompt: Arc<dyn ResumePrompt>) -> Self {
        self.resume_prompt = prompt;
        self
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn VoiceReviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ConvertError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn report(&self, stage: Stage, current: usize, total: usize, message: impl Into<String>) {
        self.progress.report(ProgressEvent {
            stage,
            current,
            total,
            message: message.into(),
        });
    }

    pub async fn run(&self) -> Result<ConversionReport> {
        let result = self.run_phases().await;
        match &result {
            Err(ConvertError::Cancelled) => {
                // Cancellation before the assignment phase leaves nothing
                // worth resuming; afterwards the state stays on disk.
                let resume = ResumeLayer::new(&self.input.output_dir);
                if !resume.has_pipeline_state(self.storage.as_ref()).await {
                    let _ = resume.purge(self.storage.as_ref()).await;
                }
                log::info!("conversion cancelled");
            }
            Err(e) => log::error!("conversion failed: kind={} {}", e.kind(), e),
            Ok(report) => log::info!(
                "conversion complete: {} files, {} chunks rendered",
                report.outputs.len(),
                report.chunks_rendered
            ),
        }
        result
    }

    async fn run_phases(&self) -> Result<ConversionReport> {
        let input = &self.input;
        let storage = self.storage.as_ref();

        // 1. Pre-flight validation.
        self.report(Stage::Validate, 0, 1, "");
        if input.text.trim().is_empty() {
            return Err(ConvertError::NoContent);
        }
        for stage in [&input.llm.extract, &input.llm.merge, &input.llm.assign] {
            if !stage.is_configured() {
                return Err(ConvertError::LlmNotConfigured);
            }
        }
        if input.output_dir.as_os_str().is_empty() {
            return Err(ConvertError::NoDirectory);
        }
        let probe = input.output_dir.join(".write_probe");
        if storage.write(&probe, b"probe").await.is_err() {
            return Err(ConvertError::NoDirectory);
        }
        let _ = storage.delete(&probe).await;
        self.report(Stage::Validate, 1, 1, "");

        // 2. Resume check.
        self.check_cancel()?;
        self.report(Stage::Resume, 0, 1, "");
        let resume = ResumeLayer::new(&input.output_dir);
        let signature = compute_signature(input);
        let mut resumed_state: Option<PipelineState> = None;
        if resume.signature_matches(storage, &signature).await
            && resume.has_pipeline_state(storage).await
        {
            let confirmed = tokio::select! {
                r = self.resume_prompt.confirm_resume() => r?,
                _ = self.cancel.cancelled() => return Err(ConvertError::Cancelled),
            };
            if confirmed {
                resumed_state = resume.load_state(storage).await?;
            }
        }
        if resumed_state.is_none() {
            resume.purge(storage).await?;
        }
        resume.save_signature(storage, &signature).await?;
        self.report(Stage::Resume, 1, 1, "");

        // 3. Voice pool with entry minima.
        self.check_cancel()?;
        let pool = VoicePool::build(&input.render.enabled_voices, &input.language);
        if pool.total() < 5 || pool.male.len() < 2 || pool.female.len() < 2 {
            return Err(ConvertError::InsufficientVoices {
                male: pool.male.len(),
                female: pool.female.len(),
            });
        }
        self.report(Stage::VoicePool, 1, 1, format!("{} voices", pool.total()));

        let paragraphs = split_paragraphs(&input.text);
        let blocks = split_blocks(&paragraphs, input.llm.max_block_tokens);

        let resumed = resumed_state.is_some();
        let (characters, mut assignments, mut voice_map, file_names) = match resumed_state {
            Some(state) => (
                state.characters,
                state.assignments,
                state.character_voice_map,
                state.file_names,
            ),
            None => {
                let pipeline = AnalysisPipeline {
                    extract_llm: self.llm.extract.as_ref(),
                    merge_llm: self.llm.merge.as_ref(),
                    assign_llm: self.llm.assign.as_ref(),
                    config: &input.llm,
                    cancel: &self.cancel,
                    progress: self.progress.as_ref(),
                };

                // 4. Extract, then the voted cross-block merge.
                let extracted = pipeline.extract(&blocks).await?;
                let characters = pipeline.merge(extracted, blocks.len()).await?;

                // 5. Initial allocation by gender.
                self.check_cancel()?;
                let initial =
                    allocate_by_gender(&pool, &characters, &input.render.narrator_voice);
                let mut voice_map = initial.voice_map;
                self.report(
                    Stage::Allocate,
                    1,
                    2,
                    format!("{} characters", characters.len()),
                );

                // 6. Assign speakers, then persist the resume state.
                let mut assignments = pipeline.assign(&blocks, &characters).await?;
                apply_voices(
                    &mut assignments,
                    &voice_map,
                    &input.render.narrator_voice,
                    &input.render.voice,
                );
                let file_names = detect_file_boundaries(&paragraphs, &input.book_name);
                resume
                    .save_state(
                        storage,
                        &PipelineState {
                            assignments: assignments.clone(),
                            character_voice_map: voice_map.clone(),
                            characters: characters.clone(),
                            file_names: file_names.clone(),
                        },
                    )
                    .await?;

                // 7. Re-allocate by frequency and remap.
                let lines = count_lines(&assignments);
                let frequency = allocate_by_frequency(
                    &pool,
                    &characters,
                    &lines,
                    &input.render.narrator_voice,
                );
                voice_map = frequency.voice_map;
                apply_voices(
                    &mut assignments,
                    &voice_map,
                    &input.render.narrator_voice,
                    &input.render.voice,
                );
                self.report(Stage::Allocate, 2, 2, "");

                (characters, assignments, voice_map, file_names)
            }
        };

        // 8. Voice review pause.
        self.check_cancel()?;
        self.report(Stage::Review, 0, 1, "");
        let request = ReviewRequest {
            characters: characters.clone(),
            voice_map: voice_map.clone(),
            assignments: assignments.clone(),
        };
        let outcome = tokio::select! {
            r = self.reviewer.review(request) => r?,
            _ = self.cancel.cancelled() => return Err(ConvertError::Cancelled),
        };
        voice_map = outcome.voice_map;
        apply_voices(
            &mut assignments,
            &voice_map,
            &input.render.narrator_voice,
            &input.render.voice,
        );
        self.report(Stage::Review, 1, 1, "");

        // 9. Persist the character profile.
        self.check_cancel()?;
        let profile_path = input
            .output_dir
            .join(&input.book_name)
            .join(format!("{}.json", input.book_name));
        let mut book_profile =
            profile::load_or_new(storage, &profile_path, &input.render.narrator_voice).await;
        book_profile.merge_session(
            &characters,
            &voice_map,
            &count_lines(&assignments),
            &input.render.narrator_voice,
            &input.book_name,
        );
        profile::save(storage, &profile_path, &book_profile).await?;
        self.report(Stage::Profile, 1, 1, "");

        // 10. Sanitise and apply the dictionary.
        self.check_cancel()?;
        let dictionary = Dictionary::parse(&input.dictionary, input.render.lexx_register);
        for a in assignments.iter_mut() {
            let cleaned = sanitize_text(&a.text);
            a.text = if dictionary.is_empty() {
                cleaned
            } else {
                dictionary.apply(&cleaned)
            };
        }
        self.report(Stage::Sanitize, 1, 1, format!("{} rules", dictionary.len()));

        // 11. Synthesis.
        self.check_cancel()?;
        let chunks = build_chunks(&assignments);
        if chunks.is_empty() {
            return Err(ConvertError::NoPronounceableContent);
        }
        tokio::fs::create_dir_all(resume.temp_dir()).await?;
        let synthesis = render_chunks(
            self.tts.clone(),
            &chunks,
            resume.temp_dir(),
            &input.render.ladder,
            input.render.tts_threads,
            input.render.tts_task_retries,
            &self.cancel,
            self.progress.as_ref(),
        )
        .await?;
        if !synthesis.failed.is_empty() {
            log::warn!(
                "{} chunks failed permanently; silence will fill their slots",
                synthesis.failed.len()
            );
        }

        // 12. Merge and encode, one segment at a time. A crashed encoder
        // gets exactly one replacement before the failure surfaces.
        let plans = plan_segments(&file_names, assignments.len());
        self.report(Stage::Encode, 0, plans.len(), "");
        let mut encoder = (self.encoder_factory)();
        let mut outputs = Vec::new();
        for (i, plan) in plans.iter().enumerate() {
            self.check_cancel()?;
            let path = match encoder
                .merge_segment(plan, resume.temp_dir(), &input.output_dir)
                .await
            {
                Ok(path) => path,
                Err(first) => {
                    log::warn!(
                        "encoder failed on segment {} ({}), retrying with a fresh instance",
                        plan.label,
                        first
                    );
                    encoder = (self.encoder_factory)();
                    encoder
                        .merge_segment(plan, resume.temp_dir(), &input.output_dir)
                        .await?
                }
            };
            outputs.push(path);
            self.report(Stage::Encode, i + 1, plans.len(), plan.label.clone());
        }

        // 13. Cleanup.
        resume.purge(storage).await?;
        self.report(Stage::Cleanup, 1, 1, "");

        Ok(ConversionReport {
            outputs,
            characters: characters.len(),
            chunks_rendered: synthesis.rendered + synthesis.skipped,
            chunks_failed: synthesis.failed.len(),
            resumed,
        })
    }
}
