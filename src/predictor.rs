//! Upload → inference → animated bars pipeline for one page.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::model::{ClassProbability, ImageModel, LoadedImage, ModelError};

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("upload is not a readable image: {0}")]
    Decode(#[source] ModelError),
    #[error("inference failed: {0}")]
    Inference(#[source] ModelError),
}

/// Shared slot the loaded model is published through. Predictors created before the model
/// finishes loading see it as soon as it is installed.
#[derive(Clone)]
pub struct ModelHandle {
    tx: Arc<watch::Sender<Option<Arc<dyn ImageModel>>>>,
}

impl ModelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn ready(model: Arc<dyn ImageModel>) -> Self {
        let handle = Self::new();
        handle.install(model);
        handle
    }

    pub fn install(&self, model: Arc<dyn ImageModel>) {
        info!(classes = model.total_classes(), "Model installed");
        self.tx.send_replace(Some(model));
    }

    pub fn current(&self) -> Option<Arc<dyn ImageModel>> {
        self.tx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves once a model is installed.
    pub async fn wait(&self) -> Option<Arc<dyn ImageModel>> {
        let mut rx = self.tx.subscribe();
        let model = rx.wait_for(|model| model.is_some()).await.map(|slot| (*slot).clone());
        model.ok().flatten()
    }
}

impl Default for ModelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarTone {
    Success,
    Danger,
    Warning,
    Primary,
}

impl BarTone {
    pub fn for_label(label: &str) -> Self {
        match label {
            "good_weld" => BarTone::Success,
            "crack" => BarTone::Danger,
            "porosity" => BarTone::Warning,
            _ => BarTone::Primary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionResult {
    pub label: String,
    /// Whole percent, 0..=100.
    pub confidence: u8,
}

impl PredictionResult {
    pub fn from_probability(score: &ClassProbability) -> Self {
        let percent = (score.probability * 100.0).round().clamp(0.0, 100.0);
        Self {
            label: score.class_name.clone(),
            confidence: percent as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionBar {
    pub label: String,
    pub confidence: u8,
    /// Current rendered width in percent; starts at 0 and moves to `confidence`.
    pub width: u8,
    pub tone: BarTone,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionView {
    pub model_ready: bool,
    pub loading: bool,
    pub pending: bool,
    pub results: Vec<PredictionBar>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Classified(Vec<PredictionResult>),
    /// The model is still loading; the image will be classified once it is ready.
    Queued,
}

#[derive(Default)]
struct PredictorState {
    results: Vec<PredictionResult>,
    widths: Vec<u8>,
    in_flight: usize,
    // Bumped per submission; stale inferences and animations compare against it.
    generation: u64,
    pending: Option<(u64, LoadedImage)>,
    waiting_for_model: bool,
}

pub struct Predictor {
    model: ModelHandle,
    state: Mutex<PredictorState>,
    animation_delay: Duration,
}

impl Predictor {
    pub fn new(model: ModelHandle, animation_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            model,
            state: Mutex::new(PredictorState::default()),
            animation_delay,
        })
    }

    /// Decodes `bytes` and classifies it, replacing any previous results.
    pub async fn submit_image(self: &Arc<Self>, bytes: &[u8]) -> Result<SubmitOutcome, PredictError> {
        let image = LoadedImage::decode(bytes).map_err(PredictError::Decode)?;
        debug!(width = image.width(), height = image.height(), "Image decoded");

        // The generation is taken at submission, so a held image is superseded by any later
        // upload even if its own classification starts afterwards.
        let (generation, model) = {
            let mut state = self.lock_state();
            state.results.clear();
            state.widths.clear();
            state.generation += 1;
            let model = self.model.current();
            if model.is_some() {
                state.pending = None;
            }
            (state.generation, model)
        };

        match model {
            Some(model) => self
                .classify(model, image, generation)
                .await
                .map(SubmitOutcome::Classified),
            None => {
                self.queue(image, generation);
                Ok(SubmitOutcome::Queued)
            }
        }
    }

    pub fn is_loading(&self) -> bool {
        self.lock_state().in_flight > 0
    }

    pub fn results(&self) -> Vec<PredictionResult> {
        self.lock_state().results.clone()
    }

    pub fn view(&self) -> PredictionView {
        let state = self.lock_state();
        let results = state
            .results
            .iter()
            .enumerate()
            .map(|(i, result)| PredictionBar {
                label: result.label.clone(),
                confidence: result.confidence,
                width: state.widths.get(i).copied().unwrap_or(0),
                tone: BarTone::for_label(&result.label),
            })
            .collect();

        PredictionView {
            model_ready: self.model.is_ready(),
            loading: state.in_flight > 0,
            pending: state.pending.is_some(),
            results,
        }
    }

    fn queue(self: &Arc<Self>, image: LoadedImage, generation: u64) {
        let mut state = self.lock_state();
        state.pending = Some((generation, image));
        if state.waiting_for_model {
            return;
        }
        state.waiting_for_model = true;
        info!("Model not loaded yet; holding image until it is");

        let predictor = Arc::clone(self);
        tokio::spawn(async move {
            let Some(model) = predictor.model.wait().await else {
                warn!("Model slot closed before a model was installed");
                return;
            };
            let held = {
                let mut state = predictor.lock_state();
                state.waiting_for_model = false;
                state.pending.take()
            };
            if let Some((generation, image)) = held {
                if let Err(e) = predictor.classify(model, image, generation).await {
                    error!("Queued classification failed: {}", e);
                }
            }
        });
    }

    async fn classify(
        self: &Arc<Self>,
        model: Arc<dyn ImageModel>,
        image: LoadedImage,
        generation: u64,
    ) -> Result<Vec<PredictionResult>, PredictError> {
        self.lock_state().in_flight += 1;
        let _loading = InFlightGuard { predictor: self };

        let scores = model.predict(&image).await.map_err(|e| {
            error!("Inference failed: {}", e);
            PredictError::Inference(e)
        })?;
        let results: Vec<PredictionResult> =
            scores.iter().map(PredictionResult::from_probability).collect();

        {
            let mut state = self.lock_state();
            if state.generation != generation {
                debug!(generation, "Discarding results of a superseded upload");
                return Ok(results);
            }
            state.results = results.clone();
            state.widths = vec![0; results.len()];
        }
        self.animate(generation);

        info!(classes = results.len(), "Image classified");
        Ok(results)
    }

    /// Second render phase: after the delay, bars take their target widths.
    fn animate(self: &Arc<Self>, generation: u64) {
        let predictor = Arc::clone(self);
        let delay = self.animation_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = predictor.lock_state();
            if state.generation == generation {
                state.widths = state.results.iter().map(|r| r.confidence).collect();
            }
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, PredictorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InFlightGuard<'a> {
    predictor: &'a Predictor,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.predictor.lock_state();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_rounds_to_whole_percent() {
        let cases = [
            (0.0, 0),
            (0.004, 0),
            (0.005, 1),
            (0.4449, 44),
            (0.445, 45),
            (0.999, 100),
            (1.0, 100),
        ];
        for (probability, expected) in cases {
            let result = PredictionResult::from_probability(&ClassProbability::new("x", probability));
            assert_eq!(result.confidence, expected, "probability {}", probability);
        }
    }

    #[test]
    fn test_confidence_is_clamped() {
        let high = PredictionResult::from_probability(&ClassProbability::new("x", 1.2));
        let low = PredictionResult::from_probability(&ClassProbability::new("x", -0.3));
        assert_eq!(high.confidence, 100);
        assert_eq!(low.confidence, 0);
    }

    #[test]
    fn test_bar_tone_by_label() {
        assert_eq!(BarTone::for_label("good_weld"), BarTone::Success);
        assert_eq!(BarTone::for_label("crack"), BarTone::Danger);
        assert_eq!(BarTone::for_label("porosity"), BarTone::Warning);
        assert_eq!(BarTone::for_label("spatter"), BarTone::Primary);
    }

    #[test]
    fn test_empty_view() {
        let predictor = Predictor::new(ModelHandle::new(), Duration::from_millis(1));
        let view = predictor.view();
        assert!(!view.model_ready);
        assert!(!view.loading);
        assert!(!view.pending);
        assert!(view.results.is_empty());
    }
}
