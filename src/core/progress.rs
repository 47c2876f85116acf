use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// Pipeline phases in execution order, as surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Resume,
    VoicePool,
    Extract,
    Merge,
    Assign,
    Allocate,
    Review,
    Profile,
    Sanitize,
    Synthesize,
    Encode,
    Cleanup,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Validate => "Validating input",
            Stage::Resume => "Checking previous session",
            Stage::VoicePool => "Building voice pool",
            Stage::Extract => "Detecting characters",
            Stage::Merge => "Merging duplicate characters",
            Stage::Assign => "Assigning speakers",
            Stage::Allocate => "Allocating voices",
            Stage::Review => "Waiting for voice review",
            Stage::Profile => "Saving character profile",
            Stage::Sanitize => "Preparing text",
            Stage::Synthesize => "Synthesizing audio",
            Stage::Encode => "Encoding output",
            Stage::Cleanup => "Cleaning up",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// Observer of externally visible status. Only the orchestrator publishes.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Sink that forwards events to the log, for headless runs and tests.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, event: ProgressEvent) {
        log::info!(
            "[{}] {}/{} {}",
            event.stage.label(),
            event.current,
            event.total,
            event.message
        );
    }
}

/// Terminal sink rendering one progress bar per stage.
pub struct ConsoleProgress {
    bar: Mutex<Option<(Stage, ProgressBar)>>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleProgress {
    fn report(&self, event: ProgressEvent) {
        let mut guard = self.bar.lock().unwrap();
        let stale = match guard.as_ref() {
            Some((stage, _)) => *stage != event.stage,
            None => true,
        };
        if stale {
            if let Some((_, old)) = guard.take() {
                old.finish_and_clear();
            }
            let bar = ProgressBar::new(event.total.max(1) as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            bar.set_prefix(event.stage.label());
            *guard = Some((event.stage, bar));
        }
        if let Some((_, bar)) = guard.as_ref() {
            bar.set_length(event.total.max(1) as u64);
            bar.set_position(event.current as u64);
            bar.set_message(event.message.clone());
            if event.current >= event.total && event.total > 0 {
                bar.finish_with_message(event.message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Capture(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Capture {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn sink_receives_events_in_order() {
        let sink = Arc::new(Capture(Mutex::new(Vec::new())));
        let dyn_sink: Arc<dyn ProgressSink> = sink.clone();
        for i in 0..3 {
            dyn_sink.report(ProgressEvent {
                stage: Stage::Extract,
                current: i,
                total: 3,
                message: format!("block {}", i),
            });
        }
        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].current, 2);
        assert_eq!(events[0].stage, Stage::Extract);
    }
}
