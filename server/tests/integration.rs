//! Integration tests for the voice cloning server

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use tower::ServiceExt;
use voice_core::DecodePolicy;
use voice_server::{audio::decode_wav_base64, build_router};

use common::*;

#[tokio::test]
async fn test_health_check() {
    let (app, _) = create_test_app();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_api_prefix() {
    let (app, _) = create_test_app();
    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_list_models() {
    let (app, _) = create_test_app();
    let (status, body) = get_json(&app, "/models").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["loaded"]["encoder"]["name"], "encoder");
    assert_eq!(body["available"].as_array().unwrap().len(), 3);
    assert_eq!(body["available"][0], "encoder@1");
    assert_eq!(body["sample_rate"], 16_000);
    assert_eq!(body["embedding_dim"], 8);
}

#[tokio::test]
async fn test_embed_endpoint_success() {
    let (app, _) = create_test_app();
    let (status, body) = post_json(
        &app,
        "/embed",
        json!({ "reference_wav_base64": voice_wav_base64(2.0) }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dim"], 8);
    let embedding: Vec<f32> = serde_json::from_value(body["embedding"].clone()).unwrap();
    let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-3);
    assert_eq!(body["reference_duration_ms"], 2000);
}

#[tokio::test]
async fn test_embed_short_reference() {
    let (app, _) = create_test_app();
    let (status, body) = post_json(
        &app,
        "/embed",
        json!({ "reference_wav_base64": voice_wav_base64(0.5) }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
    assert!(body["error"].as_str().unwrap().contains("Insufficient reference audio"));
}

#[tokio::test]
async fn test_embed_rejects_bad_audio() {
    let (app, _) = create_test_app();
    let (status, _) = post_json(&app, "/embed", json!({ "reference_wav_base64": "%%%" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &app,
        "/embed",
        json!({ "reference_wav_base64": voice_wav_base64(12.0) }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let not_wav = general_purpose::STANDARD.encode(b"hello");
    let (status, _) = post_json(&app, "/embed", json!({ "reference_wav_base64": not_wav })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_clone_endpoint_success() {
    let (app, _) = create_test_app();
    let (status, body) = post_json(
        &app,
        "/clone",
        json!({ "reference_wav_base64": voice_wav_base64(2.0), "tokens": [3, 5, 7] }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sample_rate"], 16_000);
    let wav = decode_wav_base64(body["audio_base64"].as_str().unwrap()).unwrap();
    assert_eq!(wav.sample_rate(), 16_000);
    assert!(!wav.is_empty());
    assert_eq!(body["duration_ms"], wav.duration().as_millis() as u64);
}

#[tokio::test]
async fn test_clone_endpoint_bad_tokens() {
    let (app, _) = create_test_app();
    let reference = voice_wav_base64(2.0);

    let (status, body) = post_json(
        &app,
        "/clone",
        json!({ "reference_wav_base64": reference.clone(), "tokens": [] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("empty"));

    // Outside the synthesizer's vocabulary
    let (status, _) = post_json(
        &app,
        "/clone",
        json!({ "reference_wav_base64": reference.clone(), "tokens": [3, 200] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &app,
        "/clone",
        json!({ "reference_wav_base64": reference, "tokens": vec![1u32; 65] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_clone_alignment_failure_is_unprocessable() {
    let policy = DecodePolicy {
        max_decoder_steps: 12,
        ..DecodePolicy::default()
    };
    let app = build_router(test_state_with(tiny_pipeline(-8.0, policy)));
    let (status, body) = post_json(
        &app,
        "/clone",
        json!({ "reference_wav_base64": voice_wav_base64(2.0), "tokens": [3, 4] }),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], 422);
}

#[tokio::test]
async fn test_malformed_json_rejected() {
    let (app, _) = create_test_app();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/clone")
                .header("content-type", "application/json")
                .body(Body::from("{\"tokens\": [1]}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_metrics_track_requests_and_cache() {
    let (app, _) = create_test_app();
    let reference = voice_wav_base64(2.0);
    for _ in 0..2 {
        let (status, _) = post_json(
            &app,
            "/clone",
            json!({ "reference_wav_base64": reference.clone(), "tokens": [3, 4] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = post_json(&app, "/clone", json!({ "reference_wav_base64": reference, "tokens": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get_json(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["timestamp"].is_string());
    assert_eq!(body["endpoints"]["clone"]["request_count"], 3);
    assert_eq!(body["endpoints"]["clone"]["error_count"], 1);
    assert_eq!(body["synthesis"]["synthesis_count"], 2);
    assert_eq!(body["cache"]["misses"], 1);
    assert_eq!(body["cache"]["hits"], 1);
    assert_eq!(body["streams"]["live_workers"], 0);
}
