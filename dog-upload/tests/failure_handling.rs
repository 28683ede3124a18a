use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use dog_upload::{
    CallerTier, MemoryObjectStore, RecordingSink, ScriptedMemoryMonitor, StrategyConfig, StrategyKind,
    UploadAdapter, UploadError, UploadRequest, UploadStage,
};

const MIB: usize = 1024 * 1024;

fn chunked_config() -> StrategyConfig {
    StrategyConfig::default()
        .with_thresholds(2 * MIB as u64, 64 * MIB as u64)
        .with_chunk_size(MIB as u64)
        .with_max_concurrent_chunks(2)
        .with_retries(2, Duration::from_millis(1))
}

fn video(len: usize) -> UploadRequest {
    UploadRequest::new("session.mp4", Bytes::from(vec![9u8; len]), "creator-1", CallerTier::Creator)
        .with_mime_type("video/mp4")
}

fn adapter(store: &Arc<MemoryObjectStore>, config: StrategyConfig) -> UploadAdapter {
    UploadAdapter::new(store.clone(), config)
        .unwrap()
        .with_memory_monitor(Arc::new(ScriptedMemoryMonitor::constant(0.2)))
}

#[tokio::test]
async fn cancel_mid_transfer_aborts_the_session() {
    // Arrange
    let store = Arc::new(MemoryObjectStore::default().with_part_delay(Duration::from_millis(50)));
    let adapter = adapter(&store, chunked_config());
    let sink = RecordingSink::new();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    // Act
    let err = adapter
        .upload_with_cancel(video(6 * MIB), Arc::new(sink.clone()), cancel)
        .await
        .unwrap_err();

    // Assert
    assert!(matches!(err, UploadError::SessionAborted { .. }), "{err:?}");
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(store.open_sessions(), 0);
    assert_eq!(store.object_count(), 0);
    assert!(store.part_calls() < 6);
    assert_eq!(sink.last().unwrap().stage, UploadStage::Error);
}

#[tokio::test]
async fn cancel_before_start_sends_nothing() {
    let store = Arc::new(MemoryObjectStore::default());
    let adapter = adapter(&store, chunked_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = adapter
        .upload_with_cancel(video(4 * MIB), Arc::new(RecordingSink::new()), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::SessionAborted { .. }));
    assert_eq!(store.part_calls(), 0);
    assert_eq!(store.object_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_commit_is_acknowledged_keeps_the_object() {
    // Arrange: the backend stores on commit but answers 200ms later
    let store = Arc::new(MemoryObjectStore::default().with_ack_delay(Duration::from_millis(200)));
    let adapter = adapter(&store, chunked_config());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        trigger.cancel();
    });

    // Act
    let result = adapter
        .upload_with_cancel(video(3 * MIB), Arc::new(RecordingSink::new()), cancel.clone())
        .await;

    // Assert
    assert!(cancel.is_cancelled());
    let result = result.unwrap();
    assert_eq!(result.strategy, Some(StrategyKind::ChunkedStream));
    assert_eq!(store.object_count(), 1);
    assert_eq!(store.complete_calls(), 1);
    assert_eq!(store.abort_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_put_is_acknowledged_keeps_the_object() {
    let store = Arc::new(MemoryObjectStore::default().with_ack_delay(Duration::from_millis(200)));
    let adapter = adapter(&store, chunked_config());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        trigger.cancel();
    });

    let request = UploadRequest::new("cover.png", vec![1u8; 4096], "creator-1", CallerTier::Creator)
        .with_mime_type("image/png");
    let result = adapter
        .upload_with_cancel(request, Arc::new(RecordingSink::new()), cancel.clone())
        .await
        .unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(result.strategy, Some(StrategyKind::Direct));
    assert_eq!(store.put_calls(), 1);
    assert_eq!(store.object_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_chunk_times_out_and_is_retried() {
    let store = Arc::new(MemoryObjectStore::default());
    store.stall_part(1, 1, Duration::from_secs(10));
    let config = chunked_config().with_chunk_timeout(Duration::from_millis(50));
    let adapter = adapter(&store, config);

    let result = adapter.upload(video(3 * MIB)).await.unwrap();

    assert_eq!(result.strategy, Some(StrategyKind::ChunkedStream));
    assert_eq!(store.part_attempts(1), 2);
    assert_eq!(store.last_committed_parts(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn chunk_that_always_stalls_fails_the_upload() {
    let store = Arc::new(MemoryObjectStore::default());
    store.stall_part(2, 10, Duration::from_secs(10));
    let config = chunked_config().with_chunk_timeout(Duration::from_millis(50));
    let adapter = adapter(&store, config);

    let err = adapter.upload(video(3 * MIB)).await.unwrap_err();

    match err {
        UploadError::StorageBackend {
            chunk_index,
            total_chunks,
            attempts,
            ..
        } => {
            assert_eq!(chunk_index, Some(1));
            assert_eq!(total_chunks, Some(3));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected a backend error, got {other:?}"),
    }
    assert_eq!(store.part_attempts(2), 3);
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(store.object_count(), 0);
}

#[tokio::test]
async fn failed_commit_is_retried_then_aborted() {
    let store = Arc::new(MemoryObjectStore::default());
    store.fail_completes(10);
    let adapter = adapter(&store, chunked_config());

    let err = adapter.upload(video(3 * MIB)).await.unwrap_err();

    assert!(matches!(err, UploadError::StorageBackend { attempts: 3, .. }), "{err:?}");
    assert_eq!(store.complete_calls(), 3);
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn commit_recovers_after_a_transient_failure() {
    let store = Arc::new(MemoryObjectStore::default());
    store.fail_completes(1);
    let adapter = adapter(&store, chunked_config());

    let result = adapter.upload(video(3 * MIB)).await.unwrap();

    assert!(result.success);
    assert_eq!(store.complete_calls(), 2);
    assert_eq!(store.abort_calls(), 0);
}

#[tokio::test]
async fn abort_failure_keeps_the_primary_error() {
    let store = Arc::new(MemoryObjectStore::default());
    store.fail_part(1, 10);
    store.fail_aborts();
    let adapter = adapter(&store, chunked_config());

    let err = adapter.upload(video(3 * MIB)).await.unwrap_err();

    assert!(matches!(err, UploadError::StorageBackend { chunk_index: Some(0), .. }), "{err:?}");
    assert_eq!(store.open_sessions(), 1);
    assert_eq!(store.object_count(), 0);
}

#[tokio::test]
async fn memory_pressure_fails_a_large_upload() {
    let store = Arc::new(MemoryObjectStore::default());
    let config = StrategyConfig::default()
        .with_thresholds(MIB as u64, 2 * MIB as u64)
        .with_chunk_size(MIB as u64)
        .with_retries(1, Duration::from_millis(1));
    let adapter = UploadAdapter::new(store.clone(), config)
        .unwrap()
        .with_memory_monitor(Arc::new(ScriptedMemoryMonitor::new([0.4, 0.4, 0.95])));
    let sink = RecordingSink::new();

    let err = adapter
        .upload_with_progress(video(4 * MIB), Arc::new(sink.clone()))
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::MemoryLimitExceeded { .. }), "{err:?}");
    assert!(!err.is_retryable());
    assert_eq!(store.abort_calls(), 1);
    assert_eq!(store.object_count(), 0);
    assert_eq!(sink.last().unwrap().stage, UploadStage::Error);
}
