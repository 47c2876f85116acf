use crate::core::config::LadderConfig;
use crate::core::error::{ConvertError, Result};
use crate::core::progress::{ProgressEvent, ProgressSink, Stage};
use crate::services::tts::ladder::{Ladder, Scale, TaskSample};
use crate::services::tts::{Chunk, TtsClient};
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What the pool produced, by part index.
#[derive(Debug, Default)]
pub struct SynthesisOutcome {
    pub rendered: usize,
    pub skipped: usize,
    pub failed: Vec<usize>,
}

/// Scans the chunk cache: a non-empty `chunk_NNNNNN.bin` means that part is
/// already rendered and is not resubmitted.
pub async fn prescan_existing(work_dir: &Path, chunks: &[Chunk]) -> Result<HashSet<usize>> {
    let mut done = HashSet::new();
    for chunk in chunks {
        let path = work_dir.join(&chunk.filename);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => {
                done.insert(chunk.part_index);
            }
            _ => {}
        }
    }
    Ok(done)
}

struct TaskReport {
    part_index: usize,
    success: bool,
    retries: u32,
    hit_ceiling: bool,
}

fn retry_backoff(attempt: u32) -> Duration {
    let base = Duration::from_millis(500) * 2u32.saturating_pow(attempt);
    let capped = base.min(Duration::from_secs(15));
    let jitter = rand::rng().random_range(0..500u64);
    capped + Duration::from_millis(jitter)
}

/// One synthesis task: render, then atomically publish the chunk file via a
/// temp-write and rename. Retries up to the per-task cap with jittered
/// backoff; cancellation aborts between attempts and mid-call.
async fn run_task(
    tts: Arc<dyn TtsClient>,
    chunk: Chunk,
    path: PathBuf,
    retry_cap: u32,
    cancel: CancellationToken,
) -> TaskReport {
    let mut attempt = 0u32;
    loop {
        let result = tokio::select! {
            r = tts.synthesize(&chunk.text, &chunk.voice) => r,
            _ = cancel.cancelled() => Err(ConvertError::Cancelled),
        };
        match result {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&path, &bytes).await {
                    log::warn!("chunk {} write failed: {}", chunk.part_index, e);
                    return TaskReport {
                        part_index: chunk.part_index,
                        success: false,
                        retries: attempt,
                        hit_ceiling: true,
                    };
                }
                return TaskReport {
                    part_index: chunk.part_index,
                    success: true,
                    retries: attempt,
                    hit_ceiling: false,
                };
            }
            Err(ConvertError::Cancelled) => {
                return TaskReport {
                    part_index: chunk.part_index,
                    success: false,
                    retries: attempt,
                    hit_ceiling: false,
                }
            }
            Err(e) => {
                if attempt >= retry_cap {
                    log::warn!(
                        "chunk {} failed after {} retries: {}",
                        chunk.part_index,
                        attempt,
                        e
                    );
                    return TaskReport {
                        part_index: chunk.part_index,
                        success: false,
                        retries: attempt,
                        hit_ceiling: true,
                    };
                }
                let delay = retry_backoff(attempt);
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return TaskReport {
                            part_index: chunk.part_index,
                            success: false,
                            retries: attempt,
                            hit_ceiling: false,
                        }
                    }
                }
            }
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Renders all missing chunks with an adaptively sized worker pool. The
/// in-flight task count follows the ladder target, adjusted only at
/// completion boundaries; outstanding tasks always run to their end.
/// Cancellation drains in-flight work without submitting more.
pub async fn render_chunks(
    tts: Arc<dyn TtsClient>,
    chunks: &[Chunk],
    work_dir: &Path,
    ladder_config: &LadderConfig,
    max_workers: usize,
    retry_cap: u32,
    cancel: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<SynthesisOutcome> {
    let done = prescan_existing(work_dir, chunks).await?;
    let mut queue: VecDeque<Chunk> = chunks
        .iter()
        .filter(|c| !done.contains(&c.part_index))
        .cloned()
        .collect();

    let total = chunks.len();
    let mut outcome = SynthesisOutcome {
        rendered: 0,
        skipped: done.len(),
        failed: Vec::new(),
    };
    progress.report(ProgressEvent {
        stage: Stage::Synthesize,
        current: outcome.skipped,
        total,
        message: format!("{} cached", outcome.skipped),
    });
    if queue.is_empty() {
        return Ok(outcome);
    }

    let mut ladder = Ladder::new(ladder_config, max_workers);
    let mut join_set: JoinSet<TaskReport> = JoinSet::new();

    loop {
        while join_set.len() < ladder.current() && !cancel.is_cancelled() {
            let Some(chunk) = queue.pop_front() else { break };
            let path = work_dir.join(&chunk.filename);
            join_set.spawn(run_task(
                tts.clone(),
                chunk,
                path,
                retry_cap,
                cancel.clone(),
            ));
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let report = joined
            .map_err(|e| ConvertError::Other(anyhow::anyhow!("tts task panicked: {}", e)))?;

        if report.success {
            outcome.rendered += 1;
        } else {
            outcome.failed.push(report.part_index);
        }
        progress.report(ProgressEvent {
            stage: Stage::Synthesize,
            current: outcome.skipped + outcome.rendered + outcome.failed.len(),
            total,
            message: format!("workers: {}", ladder.current()),
        });

        match ladder.record(TaskSample {
            success: report.success,
            retries: report.retries,
            hit_ceiling: report.hit_ceiling,
        }) {
            Some(Scale::Up(n)) => log::info!("tts pool scaled up to {}", n),
            Some(Scale::Down(n)) => log::info!("tts pool scaled down to {}", n),
            None => {}
        }
    }

    if cancel.is_cancelled() {
        return Err(ConvertError::Cancelled);
    }

    outcome.failed.sort_unstable();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::LogSink;
    use crate::services::tts::chunk_filename;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockTts {
        calls: AtomicUsize,
        fail_indices: Vec<usize>,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        rendered: Mutex<Vec<String>>,
    }

    impl MockTts {
        fn new(fail_indices: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_indices,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                rendered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TtsClient for MockTts {
        async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let index: usize = text
                .split_whitespace()
                .last()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if self.fail_indices.contains(&index) {
                return Err(ConvertError::Retriable("mock failure".into()));
            }
            self.rendered.lock().unwrap().push(text.to_string());
            Ok(vec![1, 2, 3])
        }
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk {
                part_index: i,
                text: format!("line {}", i),
                voice: "v".to_string(),
                filename: chunk_filename(i),
            })
            .collect()
    }

    fn ladder_config() -> LadderConfig {
        LadderConfig {
            min_workers: 2,
            sample_size: 4,
            success_threshold: 0.8,
            scale_down_factor: 0.5,
            scale_up_increment: 1,
        }
    }

    #[tokio::test]
    async fn renders_all_chunks_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let tts = Arc::new(MockTts::new(vec![]));
        let cancel = CancellationToken::new();
        let out = render_chunks(
            tts.clone(),
            &chunks(9),
            dir.path(),
            &ladder_config(),
            4,
            1,
            &cancel,
            &LogSink,
        )
        .await
        .unwrap();

        assert_eq!(out.rendered, 9);
        assert!(out.failed.is_empty());
        for i in 0..9 {
            let meta = std::fs::metadata(dir.path().join(chunk_filename(i))).unwrap();
            assert!(meta.len() > 0);
        }
        // Never exceeded the initial ladder target by more than growth allows.
        assert!(tts.max_concurrent.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn prescan_skips_existing_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(chunk_filename(0)), b"cached").unwrap();
        std::fs::write(dir.path().join(chunk_filename(1)), b"").unwrap(); // empty: redo

        let tts = Arc::new(MockTts::new(vec![]));
        let cancel = CancellationToken::new();
        let out = render_chunks(
            tts.clone(),
            &chunks(3),
            dir.path(),
            &ladder_config(),
            2,
            0,
            &cancel,
            &LogSink,
        )
        .await
        .unwrap();

        assert_eq!(out.skipped, 1);
        assert_eq!(out.rendered, 2);
        assert_eq!(tts.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let tts = Arc::new(MockTts::new(vec![2]));
        let cancel = CancellationToken::new();
        let out = render_chunks(
            tts,
            &chunks(4),
            dir.path(),
            &ladder_config(),
            2,
            1,
            &cancel,
            &LogSink,
        )
        .await
        .unwrap();

        assert_eq!(out.rendered, 3);
        assert_eq!(out.failed, vec![2]);
        assert!(!dir.path().join(chunk_filename(2)).exists());
    }

    #[tokio::test]
    async fn cancellation_stops_new_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let tts = Arc::new(MockTts::new(vec![]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = render_chunks(
            tts.clone(),
            &chunks(6),
            dir.path(),
            &ladder_config(),
            2,
            0,
            &cancel,
            &LogSink,
        )
        .await;
        assert!(matches!(result, Err(ConvertError::Cancelled)));
        assert_eq!(tts.calls.load(Ordering::SeqCst), 0);
    }
}
