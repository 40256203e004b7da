mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use common::*;
use voice_core::{
    AudioChunk, CancelToken, DeliveryMode, PipelineConfig, SpeechOutput, TextSequence, VoiceError,
};

const IDLE: Duration = Duration::from_secs(5);

async fn stream_all(output: SpeechOutput) -> Vec<voice_core::Result<AudioChunk>> {
    let stream = output.into_stream().unwrap();
    stream.collect().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chunks_are_ordered_and_end_with_final() {
    let (pipeline, _, _) = stub_pipeline(ScriptedSynthesizer::new(Some(37)), small_windows());
    let output = pipeline
        .clone_and_speak(
            voice(1.0, 120.0),
            TextSequence::new(vec![2, 5, 7]),
            DeliveryMode::Streaming,
            CancelToken::new(),
        )
        .await
        .unwrap();

    let chunks: Vec<AudioChunk> = stream_all(output).await.into_iter().map(|c| c.unwrap()).collect();
    assert!(chunks.len() > 1);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.index, i as u64);
        assert_eq!(chunk.sample_rate, SAMPLE_RATE);
        assert_eq!(chunk.is_final, i == chunks.len() - 1);
    }
    let total: usize = chunks.iter().map(|c| c.samples.len()).sum();
    assert_eq!(total, 37 * HOP);
    assert!(pipeline.resources().wait_idle(IDLE).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_streamed_audio_matches_complete_audio() {
    let mut config = small_windows();
    config.segmentation.clause_breaks = vec![1];
    config.segmentation.clause_pause_frames = 3;
    let (pipeline, _, _) = stub_pipeline(ScriptedSynthesizer::new(Some(21)), config);
    let reference = voice(1.2, 130.0);
    let tokens = TextSequence::new(vec![4, 1, 6, 9]);

    let complete = pipeline
        .clone_and_speak(reference.clone(), tokens.clone(), DeliveryMode::Complete, CancelToken::new())
        .await
        .unwrap()
        .into_waveform()
        .unwrap();
    let streamed = pipeline
        .clone_and_speak(reference, tokens, DeliveryMode::Streaming, CancelToken::new())
        .await
        .unwrap()
        .into_stream()
        .unwrap()
        .collect_waveform()
        .await
        .unwrap();

    assert_eq!(streamed.len(), complete.len());
    assert_eq!(complete.len(), (21 + 3 + 21) * HOP);
    for (a, b) in streamed.samples().iter().zip(complete.samples()) {
        assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_chunk_arrives_before_synthesis_completes() {
    let gate = Arc::new(Gate::default());
    let mut synthesizer = ScriptedSynthesizer::new(Some(60));
    // Enough frames for the first window plus vocoder context
    synthesizer.gate_after = Some((20, gate.clone()));
    let (pipeline, _, synthesizer) = stub_pipeline(synthesizer, small_windows());

    let mut stream = pipeline
        .clone_and_speak(voice(1.0, 120.0), TextSequence::new(vec![3]), DeliveryMode::Streaming, CancelToken::new())
        .await
        .unwrap()
        .into_stream()
        .unwrap();

    let first = tokio::time::timeout(IDLE, stream.next_chunk())
        .await
        .expect("first chunk while the synthesizer is held")
        .unwrap()
        .unwrap();
    assert_eq!(first.index, 0);
    assert!(!first.is_final);
    assert!(synthesizer.emitted() <= 20);

    gate.open();
    let mut last = first;
    while let Some(chunk) = stream.next_chunk().await {
        last = chunk.unwrap();
    }
    assert!(last.is_final);
    assert_eq!(synthesizer.emitted(), 60);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_stops_promptly_and_releases_resources() {
    let mut synthesizer = ScriptedSynthesizer::new(None);
    synthesizer.max_steps = 100_000;
    synthesizer.frame_delay = Duration::from_millis(1);
    let (pipeline, _, synthesizer) = stub_pipeline(synthesizer, small_windows());

    let mut stream = pipeline
        .clone_and_speak(voice(1.0, 120.0), TextSequence::new(vec![3]), DeliveryMode::Streaming, CancelToken::new())
        .await
        .unwrap()
        .into_stream()
        .unwrap();

    let first = stream.next_chunk().await.unwrap().unwrap();
    assert_eq!(first.index, 0);
    stream.cancel();

    assert_eq!(stream.next_chunk().await, Some(Err(VoiceError::Cancelled)));
    assert_eq!(stream.next_chunk().await, None);

    assert!(pipeline.resources().wait_idle(IDLE).await);
    let stopped_at = synthesizer.emitted();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(synthesizer.emitted(), stopped_at);
    assert!(stopped_at < 100_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_consumer_holds_back_synthesis() {
    let (pipeline, _, synthesizer) = stub_pipeline(ScriptedSynthesizer::new(Some(500)), small_windows());

    let stream = pipeline
        .clone_and_speak(voice(1.0, 120.0), TextSequence::new(vec![3]), DeliveryMode::Streaming, CancelToken::new())
        .await
        .unwrap()
        .into_stream()
        .unwrap();

    // Nothing is read: both queues fill and the workers block
    tokio::time::sleep(Duration::from_millis(150)).await;
    let held_at = synthesizer.emitted();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(synthesizer.emitted(), held_at);
    assert!(held_at < 100, "synthesizer ran ahead to frame {}", held_at);

    let resources = pipeline.resources();
    // Queue capacity plus the one message blocked in `send`
    assert!(resources.buffered_frames() <= 4 + 1);
    assert!(resources.buffered_chunks() <= 2 + 1);
    assert_eq!(resources.live_workers(), 2);

    drop(stream);
    assert!(resources.wait_idle(IDLE).await);
    assert!(synthesizer.emitted() < 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropping_the_stream_cancels_workers() {
    let mut synthesizer = ScriptedSynthesizer::new(None);
    synthesizer.max_steps = 100_000;
    synthesizer.frame_delay = Duration::from_millis(1);
    let (pipeline, _, _) = stub_pipeline(synthesizer, small_windows());
    let cancel = CancelToken::new();

    let mut stream = pipeline
        .clone_and_speak(voice(1.0, 120.0), TextSequence::new(vec![3]), DeliveryMode::Streaming, cancel.clone())
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    stream.next_chunk().await.unwrap().unwrap();
    drop(stream);

    assert!(cancel.is_cancelled());
    assert!(pipeline.resources().wait_idle(IDLE).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caller_token_cancels_stream() {
    let mut synthesizer = ScriptedSynthesizer::new(None);
    synthesizer.max_steps = 100_000;
    synthesizer.frame_delay = Duration::from_millis(1);
    let (pipeline, _, _) = stub_pipeline(synthesizer, small_windows());
    let cancel = CancelToken::new();

    let output = pipeline
        .clone_and_speak(voice(1.0, 120.0), TextSequence::new(vec![3]), DeliveryMode::Streaming, cancel.clone())
        .await
        .unwrap();
    let mut stream = output.into_stream().unwrap();
    stream.next_chunk().await.unwrap().unwrap();
    cancel.cancel();

    let mut tail = Vec::new();
    while let Some(item) = stream.next_chunk().await {
        tail.push(item);
    }
    // Chunks already queued may still arrive; the stream ends with the marker
    assert_eq!(tail.last(), Some(&Err(VoiceError::Cancelled)));
    assert!(tail.iter().all(|item| item.as_ref().map_or(true, |c| !c.is_final)));
    assert!(pipeline.resources().wait_idle(IDLE).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alignment_failure_ends_stream() {
    let mut synthesizer = ScriptedSynthesizer::new(None);
    synthesizer.max_steps = 40;
    let (pipeline, _, _) = stub_pipeline(synthesizer, small_windows());

    let output = pipeline
        .clone_and_speak(voice(1.0, 120.0), TextSequence::new(vec![3]), DeliveryMode::Streaming, CancelToken::new())
        .await
        .unwrap();
    let items = stream_all(output).await;

    let (last, chunks) = items.split_last().unwrap();
    assert!(matches!(last, Err(VoiceError::AlignmentFailure { steps: 40, .. })));
    for (i, item) in chunks.iter().enumerate() {
        let chunk = item.as_ref().unwrap();
        assert_eq!(chunk.index, i as u64);
        assert!(!chunk.is_final);
    }
    assert!(pipeline.resources().wait_idle(IDLE).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_are_independent() {
    let (pipeline, encoder, _) = stub_pipeline(ScriptedSynthesizer::new(Some(30)), small_windows());
    let reference = voice(1.0, 120.0);

    let mut handles = Vec::new();
    for token in [3u32, 4, 5, 6] {
        let pipeline = pipeline.clone();
        let reference = reference.clone();
        handles.push(tokio::spawn(async move {
            pipeline
                .clone_and_speak(reference, TextSequence::new(vec![token]), DeliveryMode::Streaming, CancelToken::new())
                .await
                .unwrap()
                .into_stream()
                .unwrap()
                .collect_waveform()
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().len(), 30 * HOP);
    }
    // Concurrent first requests may each miss the cache
    assert!(encoder.calls() >= 1 && encoder.calls() <= 4);
    assert!(pipeline.resources().wait_idle(IDLE).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_complete_mode_ignores_stream_settings() {
    let mut config = PipelineConfig::default();
    config.streaming.windowing.window_frames = 3;
    config.streaming.windowing.overlap_frames = 1;
    let (pipeline, _, _) = stub_pipeline(ScriptedSynthesizer::new(Some(10)), config);

    let wav = pipeline
        .clone_and_speak(voice(1.0, 120.0), TextSequence::new(vec![3]), DeliveryMode::Complete, CancelToken::new())
        .await
        .unwrap()
        .into_waveform()
        .unwrap();
    assert_eq!(wav.len(), 10 * HOP);
}
