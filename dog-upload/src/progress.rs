use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Where an upload currently is; variants are in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Validation,
    Upload,
    Processing,
    Finalization,
    Complete,
    Error,
}

/// One progress record; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub stage: UploadStage,
    /// 0-100, non-decreasing within one request
    pub percent: f64,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    /// Bytes per second since the transfer started
    pub speed: Option<f64>,
    /// Seconds remaining at the current speed
    pub eta_secs: Option<f64>,
    pub message: String,
}

/// Consumer of progress records; must not block the strategy
pub trait ProgressSink: Send + Sync {
    fn emit(&self, progress: UploadProgress);
}

/// Drops every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _progress: UploadProgress) {}
}

/// Forwards records to a plain callback
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(UploadProgress) + Send + Sync,
{
    fn emit(&self, progress: UploadProgress) {
        (self.0)(progress)
    }
}

/// Buffers records on an unbounded channel for an async consumer
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UploadProgress>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, progress: UploadProgress) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.tx.send(progress);
    }
}

/// Collects every record; handy for inspecting a finished upload
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<UploadProgress>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UploadProgress> {
        self.records.lock().clone()
    }

    pub fn percents(&self) -> Vec<f64> {
        self.records.lock().iter().map(|p| p.percent).collect()
    }

    pub fn last(&self) -> Option<UploadProgress> {
        self.records.lock().last().cloned()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, progress: UploadProgress) {
        self.records.lock().push(progress);
    }
}

const VALIDATION_END: f64 = 5.0;
const UPLOAD_END: f64 = 95.0;
const FINALIZATION_END: f64 = 99.0;

struct ReporterState {
    stage: UploadStage,
    percent: f64,
    bytes_uploaded: u64,
    started: Option<Instant>,
    finished: bool,
}

/// Turns strategy events into monotonic progress records for one request
///
/// Concurrent chunk tasks report through the same reporter; the state lock is
/// held while emitting so the sink sees records in percent order.
pub struct ProgressReporter {
    total_bytes: u64,
    sink: Arc<dyn ProgressSink>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(total_bytes: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            total_bytes,
            sink,
            state: Mutex::new(ReporterState {
                stage: UploadStage::Validation,
                percent: 0.0,
                bytes_uploaded: 0,
                started: None,
                finished: false,
            }),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.state.lock().bytes_uploaded
    }

    pub fn percent(&self) -> f64 {
        self.state.lock().percent
    }

    /// `fraction` of the validation stage is done
    pub fn validation(&self, fraction: f64, message: &str) {
        let percent = VALIDATION_END * fraction.clamp(0.0, 1.0);
        self.emit(UploadStage::Validation, percent, message);
    }

    /// `bytes` more have been accepted by the backend
    pub fn advance(&self, bytes: u64, message: &str) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.started.get_or_insert_with(Instant::now);
        state.bytes_uploaded = (state.bytes_uploaded + bytes).min(self.total_bytes);
        let fraction = if self.total_bytes == 0 {
            1.0
        } else {
            state.bytes_uploaded as f64 / self.total_bytes as f64
        };
        let percent = VALIDATION_END + (UPLOAD_END - VALIDATION_END) * fraction;
        self.emit_locked(&mut state, UploadStage::Upload, percent, message);
    }

    /// Mark the start of the byte transfer so speed is measured from here
    pub fn transfer_started(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.started.get_or_insert_with(Instant::now);
        let percent = state.percent.max(VALIDATION_END);
        self.emit_locked(&mut state, UploadStage::Upload, percent, "transfer started");
    }

    /// Every part is in; the session commit is still part of the upload stage
    pub fn committing(&self, message: &str) {
        self.emit(UploadStage::Upload, UPLOAD_END, message);
    }

    /// Post-transfer work (dimensions, hashing) on a payload that is fully stored
    pub fn processing(&self, message: &str) {
        self.emit(UploadStage::Processing, UPLOAD_END, message);
    }

    pub fn finalizing(&self, message: &str) {
        self.emit(UploadStage::Finalization, FINALIZATION_END, message);
    }

    pub fn complete(&self, message: &str) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        self.emit_locked(&mut state, UploadStage::Complete, 100.0, message);
        state.finished = true;
    }

    /// Final record of a failed upload; keeps the last percent reached
    pub fn error(&self, message: &str) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        let percent = state.percent;
        self.emit_locked(&mut state, UploadStage::Error, percent, message);
        state.finished = true;
    }

    fn emit(&self, stage: UploadStage, percent: f64, message: &str) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        self.emit_locked(&mut state, stage, percent, message);
    }

    fn emit_locked(&self, state: &mut ReporterState, stage: UploadStage, percent: f64, message: &str) {
        // Late events from concurrent chunks keep the stage already reached
        state.stage = state.stage.max(stage);
        state.percent = state.percent.max(percent.clamp(0.0, 100.0));

        let elapsed = state.started.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);
        let speed = (elapsed > 0.0 && state.bytes_uploaded > 0)
            .then(|| state.bytes_uploaded as f64 / elapsed);
        let eta_secs = speed
            .filter(|s| *s > 0.0)
            .map(|s| (self.total_bytes - state.bytes_uploaded) as f64 / s);

        self.sink.emit(UploadProgress {
            stage: state.stage,
            percent: state.percent,
            bytes_uploaded: state.bytes_uploaded,
            total_bytes: self.total_bytes,
            speed,
            eta_secs,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(total: u64) -> (ProgressReporter, RecordingSink) {
        let sink = RecordingSink::new();
        (ProgressReporter::new(total, Arc::new(sink.clone())), sink)
    }

    #[test]
    fn percent_never_decreases() {
        let (reporter, sink) = reporter(100);
        reporter.validation(1.0, "validated");
        reporter.advance(50, "chunk");
        reporter.validation(0.0, "late validation event");
        reporter.advance(50, "chunk");
        reporter.finalizing("committing");
        reporter.complete("done");

        let percents = sink.percents();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(percents.last().copied(), Some(100.0));
    }

    #[test]
    fn stage_never_moves_backwards() {
        let (reporter, sink) = reporter(100);
        reporter.validation(1.0, "validated");
        reporter.advance(100, "chunk");
        reporter.committing("committing 1 parts");
        reporter.processing("inspecting payload");
        reporter.advance(0, "late chunk event");
        reporter.finalizing("building result");
        reporter.complete("done");

        let stages: Vec<UploadStage> = sink.records().iter().map(|p| p.stage).collect();
        assert!(stages.windows(2).all(|w| w[0] <= w[1]), "{stages:?}");
        assert_eq!(sink.records()[2].stage, UploadStage::Upload);
        assert_eq!(sink.records()[4].stage, UploadStage::Processing);
    }

    #[test]
    fn error_is_terminal_and_bounded() {
        let (reporter, sink) = reporter(100);
        reporter.advance(250, "overshoot");
        reporter.error("boom");
        reporter.complete("ignored");

        let last = sink.last().unwrap();
        assert_eq!(last.stage, UploadStage::Error);
        assert!(last.bytes_uploaded <= last.total_bytes);
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn channel_sink_never_blocks() {
        let (sink, mut rx) = ChannelSink::new();
        let reporter = ProgressReporter::new(10, Arc::new(sink));
        for _ in 0..10 {
            reporter.advance(1, "byte");
        }
        reporter.complete("done");

        let mut count = 0;
        while let Ok(progress) = rx.try_recv() {
            count += 1;
            assert!(progress.percent <= 100.0);
        }
        assert_eq!(count, 11);
    }
}
