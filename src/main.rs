use anyhow::{Context, Result};
use async_trait::async_trait;
use bookcast::core::config::{Config, OrchestratorInput};
use bookcast::core::error::ConvertError;
use bookcast::core::io::NativeStorage;
use bookcast::core::progress::ConsoleProgress;
use bookcast::services::llm::OpenAiClient;
use bookcast::services::merger::AudioMerger;
use bookcast::services::resume::ResumeLayer;
use bookcast::services::tts::HttpTtsClient;
use bookcast::services::voices::voice_parts;
use bookcast::services::workflow::{
    ConversionJob, LlmClients, ResumePrompt, ReviewOutcome, ReviewRequest, VoiceReviewer,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct ConsolePrompts;

#[async_trait]
impl ResumePrompt for ConsolePrompts {
    async fn confirm_resume(&self) -> bookcast::core::error::Result<bool> {
        tokio::task::spawn_blocking(|| {
            inquire::Confirm::new("A matching previous session was found. Resume it?")
                .with_default(true)
                .prompt()
                .unwrap_or(false)
        })
        .await
        .map_err(|e| ConvertError::Other(anyhow::anyhow!("prompt task failed: {}", e)))
    }
}

#[async_trait]
impl VoiceReviewer for ConsolePrompts {
    async fn review(&self, request: ReviewRequest) -> bookcast::core::error::Result<ReviewOutcome> {
        println!("\nDetected characters and voices:");
        for character in &request.characters {
            let voice = request
                .voice_map
                .get(&character.name)
                .map(String::as_str)
                .unwrap_or("-");
            let (_, voice_name) = voice_parts(voice);
            println!("  {:<24} {}", character.name, voice_name);
        }
        let accepted = tokio::task::spawn_blocking(|| {
            inquire::Confirm::new("Continue with these voices?")
                .with_default(true)
                .prompt()
                .unwrap_or(false)
        })
        .await
        .map_err(|e| ConvertError::Other(anyhow::anyhow!("prompt task failed: {}", e)))?;
        if accepted {
            Ok(ReviewOutcome {
                voice_map: request.voice_map,
            })
        } else {
            Err(ConvertError::Cancelled)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load(Path::new("config.yml")) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and TTS settings.");
            return Err(e);
        }
    };

    let text = tokio::fs::read_to_string(&config.input_file)
        .await
        .with_context(|| format!("Failed to read input file {}", config.input_file))?;

    let dictionary = match &config.dictionary_file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read dictionary {}", path))?
            .lines()
            .map(|l| l.to_string())
            .collect(),
        None => Vec::new(),
    };

    let input = OrchestratorInput {
        llm: config.llm.clone(),
        render: config.render.clone(),
        audio: config.audio.clone(),
        output_dir: config.output_folder.clone().into(),
        language: config.language.clone(),
        dictionary,
        text,
        book_name: config.book_name(),
    };

    let resume = ResumeLayer::new(&input.output_dir);
    let logs_dir = resume.logs_dir();
    let llm = LlmClients {
        extract: Box::new(
            OpenAiClient::new("extract", &input.llm.extract)?.with_debug_dir(logs_dir.clone()),
        ),
        merge: Box::new(
            OpenAiClient::new("merge", &input.llm.merge)?.with_debug_dir(logs_dir.clone()),
        ),
        assign: Box::new(
            OpenAiClient::new("assign", &input.llm.assign)?.with_debug_dir(logs_dir),
        ),
    };
    let tts = Arc::new(HttpTtsClient::new(&input.render)?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received, draining...");
                cancel.cancel();
            }
        });
    }

    let audio = input.audio.clone();
    let job = ConversionJob::new(
        input,
        llm,
        tts,
        Arc::new(NativeStorage::new()),
        Box::new(move || Box::new(AudioMerger::new(&audio))),
    )
    .with_progress(Arc::new(ConsoleProgress::new()))
    .with_resume_prompt(Arc::new(ConsolePrompts))
    .with_reviewer(Arc::new(ConsolePrompts))
    .with_cancel(cancel);

    match job.run().await {
        Ok(report) => {
            println!(
                "\nDone: {} file(s), {} characters, {} chunks rendered ({} failed).",
                report.outputs.len(),
                report.characters,
                report.chunks_rendered,
                report.chunks_failed
            );
            for path in &report.outputs {
                println!("  {}", path.display());
            }
            Ok(())
        }
        Err(ConvertError::Cancelled) => {
            println!("\nCancelled. Run again with the same input to resume.");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}
