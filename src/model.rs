//! The image classification collaborator: resource loading, image preprocessing and the
//! HTTP inference backend.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::ModelConfig;
use crate::constants::DEFAULT_IMAGE_SIZE;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("could not process image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("inference endpoint answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("inference endpoint sent an unusable body: {0}")]
    Body(String),
}

/// One class score as produced by the model, probability in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassProbability {
    #[serde(rename = "className")]
    pub class_name: String,
    pub probability: f64,
}

impl ClassProbability {
    pub fn new(class_name: impl Into<String>, probability: f64) -> Self {
        Self {
            class_name: class_name.into(),
            probability,
        }
    }
}

/// A decoded upload, ready to hand to a model.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pixels: DynamicImage,
    format: Option<ImageFormat>,
}

impl LoadedImage {
    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        let format = image::guess_format(bytes).ok();
        let pixels = image::load_from_memory(bytes)?;
        Ok(Self { pixels, format })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    /// Center-crops to a square and scales to `size`x`size`, the way the classifier was
    /// trained.
    pub fn to_square(&self, size: u32) -> DynamicImage {
        let side = self.width().min(self.height());
        let x = (self.width() - side) / 2;
        let y = (self.height() - side) / 2;
        self.pixels
            .crop_imm(x, y, side, side)
            .resize_exact(size, size, FilterType::Triangle)
    }

    /// PNG encoding of [`LoadedImage::to_square`].
    pub fn to_model_input(&self, size: u32) -> Result<Vec<u8>, ModelError> {
        let mut buffer = Cursor::new(Vec::new());
        self.to_square(size)
            .to_rgb8()
            .write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }
}

#[async_trait]
pub trait ImageModel: Send + Sync {
    fn total_classes(&self) -> usize;

    /// Scores for every class, in the model's own order.
    async fn predict(&self, image: &LoadedImage) -> Result<Vec<ClassProbability>, ModelError>;
}

/// The parts of a Teachable Machine `metadata.json` this crate uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelMetadata {
    pub labels: Vec<String>,
    #[serde(default, rename = "imageSize")]
    pub image_size: Option<u32>,
    #[serde(default, rename = "modelName")]
    pub model_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Classes(Vec<ClassProbability>),
    Probabilities { probabilities: Vec<f64> },
}

/// Model whose weights are served by an external inference endpoint. Labels and input size
/// come from the local metadata.
#[derive(Debug)]
pub struct RemoteModel {
    http: Client,
    inference_url: String,
    metadata: ModelMetadata,
}

impl RemoteModel {
    pub fn new(inference_url: impl Into<String>, metadata: ModelMetadata) -> Self {
        Self {
            http: Client::new(),
            inference_url: inference_url.into(),
            metadata,
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn image_size(&self) -> u32 {
        self.metadata.image_size.unwrap_or(DEFAULT_IMAGE_SIZE)
    }

    fn label_scores(&self, response: InferenceResponse) -> Result<Vec<ClassProbability>, ModelError> {
        match response {
            InferenceResponse::Classes(classes) => Ok(classes),
            InferenceResponse::Probabilities { probabilities } => {
                if probabilities.len() != self.metadata.labels.len() {
                    return Err(ModelError::Body(format!(
                        "expected {} probabilities, got {}",
                        self.metadata.labels.len(),
                        probabilities.len()
                    )));
                }
                Ok(self
                    .metadata
                    .labels
                    .iter()
                    .zip(probabilities)
                    .map(|(label, probability)| ClassProbability::new(label.clone(), probability))
                    .collect())
            }
        }
    }
}

#[async_trait]
impl ImageModel for RemoteModel {
    fn total_classes(&self) -> usize {
        self.metadata.labels.len()
    }

    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    async fn predict(&self, image: &LoadedImage) -> Result<Vec<ClassProbability>, ModelError> {
        let input = image.to_model_input(self.image_size())?;

        let response = self
            .http
            .post(&self.inference_url)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(input)
            .send()
            .await
            .map_err(|source| ModelError::Transport {
                url: self.inference_url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(ModelError::Status { status, body });
        }

        let parsed = response
            .json::<InferenceResponse>()
            .await
            .map_err(|e| ModelError::Body(e.to_string()))?;
        let scores = self.label_scores(parsed)?;
        debug!(?scores, "Inference scores");
        Ok(scores)
    }
}

/// Reads a resource from an `http(s)` URL or a local path.
async fn fetch_resource(location: &str) -> Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let response = reqwest::get(location)
            .await
            .with_context(|| format!("Failed to fetch {}", location))?
            .error_for_status()
            .with_context(|| format!("Failed to fetch {}", location))?;
        response
            .text()
            .await
            .with_context(|| format!("Failed to read body of {}", location))
    } else {
        tokio::fs::read_to_string(location)
            .await
            .with_context(|| format!("Failed to read {}", location))
    }
}

/// Loads the model definition and metadata and binds them to the inference endpoint.
pub async fn load(config: &ModelConfig) -> Result<RemoteModel> {
    let definition: Value = serde_json::from_str(&fetch_resource(&config.model_url).await?)
        .with_context(|| format!("Model definition {} is not JSON", config.model_url))?;
    if !definition.is_object() {
        return Err(anyhow!(
            "Model definition {} is not a JSON object",
            config.model_url
        ));
    }

    let metadata: ModelMetadata = serde_json::from_str(&fetch_resource(&config.metadata_url).await?)
        .with_context(|| format!("Failed to parse model metadata {}", config.metadata_url))?;
    if metadata.labels.is_empty() {
        return Err(anyhow!("Model metadata {} lists no labels", config.metadata_url));
    }

    info!(
        model = metadata.model_name.as_deref().unwrap_or("unnamed"),
        classes = metadata.labels.len(),
        "Model loaded"
    );
    Ok(RemoteModel::new(config.inference_url.clone(), metadata))
}
