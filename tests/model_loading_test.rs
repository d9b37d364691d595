use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tempfile::TempDir;
use weld_mentor::config::ModelConfig;
use weld_mentor::model::{self, ClassProbability, ImageModel, LoadedImage, ModelError};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const METADATA: &str = r#"{
    "tfjsVersion": "1.3.1",
    "tmVersion": "2.4.10",
    "packageName": "@teachablemachine/image",
    "modelName": "weld-defects",
    "labels": ["good_weld", "crack", "porosity"],
    "imageSize": 64
}"#;

const MODEL: &str = r#"{"format": "layers-model", "modelTopology": {}, "weightsManifest": []}"#;

fn write_resources(dir: &Path, model_json: &str, metadata_json: &str) -> (String, String) {
    let model_path = dir.join("model.json");
    let metadata_path = dir.join("metadata.json");
    fs::write(&model_path, model_json).unwrap();
    fs::write(&metadata_path, metadata_json).unwrap();
    (
        model_path.to_string_lossy().into_owned(),
        metadata_path.to_string_lossy().into_owned(),
    )
}

fn config(model_url: String, metadata_url: String, inference_url: String) -> ModelConfig {
    ModelConfig {
        model_url,
        metadata_url,
        inference_url,
    }
}

fn photo() -> LoadedImage {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(120, 80, Rgb([10, 20, 30])))
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
    LoadedImage::decode(&buffer.into_inner()).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_load_local_files_and_predict() {
    let dir = TempDir::new().unwrap();
    let (model_url, metadata_url) = write_resources(dir.path(), MODEL, METADATA);

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .and(header("Content-Type", "image/png"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"className": "good_weld", "probability": 0.1},
            {"className": "crack", "probability": 0.85},
            {"className": "porosity", "probability": 0.05}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let loaded = model::load(&config(model_url, metadata_url, format!("{}/predict", server.uri())))
        .await
        .unwrap();
    assert_eq!(loaded.total_classes(), 3);
    assert_eq!(loaded.metadata().model_name.as_deref(), Some("weld-defects"));

    let scores = loaded.predict(&photo()).await.unwrap();
    assert_eq!(
        scores,
        vec![
            ClassProbability::new("good_weld", 0.1),
            ClassProbability::new("crack", 0.85),
            ClassProbability::new("porosity", 0.05),
        ]
    );

    // The endpoint receives the square crop at the metadata's input size.
    let requests = server.received_requests().await.unwrap();
    let sent = LoadedImage::decode(&requests[0].body).unwrap();
    assert_eq!((sent.width(), sent.height()), (64, 64));
}

#[tokio::test]
async fn test_load_resources_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/model/model.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MODEL))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/model/metadata.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(METADATA))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/predict"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"probabilities": [0.6, 0.3, 0.1]})),
        )
        .mount(&server)
        .await;

    let loaded = model::load(&config(
        format!("{}/model/model.json", server.uri()),
        format!("{}/model/metadata.json", server.uri()),
        format!("{}/predict", server.uri()),
    ))
    .await
    .unwrap();

    let scores = loaded.predict(&photo()).await.unwrap();
    let labels: Vec<_> = scores.iter().map(|s| s.class_name.as_str()).collect();
    assert_eq!(labels, vec!["good_weld", "crack", "porosity"]);
    assert_eq!(scores[0].probability, 0.6);
}

#[tokio::test]
async fn test_missing_resource_fails_to_load() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.json").to_string_lossy().into_owned();
    let (_, metadata_url) = write_resources(dir.path(), MODEL, METADATA);

    let err = model::load(&config(missing, metadata_url, "http://unused".to_string()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Failed to read"));
}

#[tokio::test]
async fn test_metadata_without_labels_fails_to_load() {
    let dir = TempDir::new().unwrap();
    let (model_url, metadata_url) = write_resources(dir.path(), MODEL, r#"{"labels": []}"#);

    let err = model::load(&config(model_url, metadata_url, "http://unused".to_string()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("lists no labels"));
}

#[tokio::test]
async fn test_non_object_model_definition_fails_to_load() {
    let dir = TempDir::new().unwrap();
    let (model_url, metadata_url) = write_resources(dir.path(), "[1, 2, 3]", METADATA);

    let err = model::load(&config(model_url, metadata_url, "http://unused".to_string()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("not a JSON object"));
}

#[tokio::test]
async fn test_inference_error_status() {
    let dir = TempDir::new().unwrap();
    let (model_url, metadata_url) = write_resources(dir.path(), MODEL, METADATA);
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .mount(&server)
        .await;

    let loaded = model::load(&config(model_url, metadata_url, server.uri()))
        .await
        .unwrap();
    let err = loaded.predict(&photo()).await.unwrap_err();

    assert!(matches!(err, ModelError::Status { .. }));
}
