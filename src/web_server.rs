use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Request, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{delete, get},
    serve, Json, Router,
};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{sync::RwLock, task::JoinHandle};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::chat::ChatWidget;
use crate::config::ServerConfig;
use crate::constants::{APP_TITLE, MAX_UPLOAD_BYTES};
use crate::dialogue::DialogueClient;
use crate::predictor::{ModelHandle, PredictError, PredictionView, Predictor};
use crate::render::markdown_to_html;
use crate::session::SessionContext;
use crate::transcript::{ChatMessage, TranscriptEntry};

/// Both widgets of one loaded page. They share nothing but the session they were created for.
pub struct PageSession {
    pub chat: ChatWidget,
    pub predictor: Arc<Predictor>,
    last_seen: Mutex<Instant>,
}

impl PageSession {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    fn is_busy(&self) -> bool {
        self.chat.is_loading() || self.predictor.is_loading()
    }
}

// Shared application state
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    sessions: Arc<RwLock<HashMap<String, Arc<PageSession>>>>,
    dialogue: Arc<dyn DialogueClient>,
    model: ModelHandle,
    animation_delay: Duration,
    session_idle: Duration,
}

impl AppState {
    pub fn new(config: &ServerConfig, dialogue: Arc<dyn DialogueClient>, model: ModelHandle) -> Self {
        Self {
            templates: Arc::new(create_minijinja_env(config.template_dir.clone())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            dialogue,
            model,
            animation_delay: config.animation_delay,
            session_idle: config.session_idle,
        }
    }

    pub async fn open_session(&self) -> SessionContext {
        let session = SessionContext::new();
        let page = PageSession {
            chat: ChatWidget::new(session.clone(), self.dialogue.clone()),
            predictor: Predictor::new(self.model.clone(), self.animation_delay),
            last_seen: Mutex::new(Instant::now()),
        };
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), Arc::new(page));
        info!(session = %session, "Page session opened");
        session
    }

    pub async fn session(&self, id: &str) -> Option<Arc<PageSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drops sessions idle longer than the configured limit, unless a turn or upload is
    /// still running for them. Returns how many were dropped.
    pub async fn expire_idle_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, page| {
            let keep = page.is_busy() || page.idle_for() < self.session_idle;
            if !keep {
                info!(session = %id, "Page session expired");
            }
            keep
        });
        before - sessions.len()
    }

    /// Runs `expire_idle_sessions` periodically for the lifetime of the returned task.
    pub fn spawn_session_sweeper(&self) -> JoinHandle<()> {
        let state = self.clone();
        let period = (self.session_idle / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let expired = state.expire_idle_sessions().await;
                if expired > 0 {
                    let remaining = state.session_count().await;
                    debug!(expired, remaining, "Swept idle sessions");
                }
            }
        })
    }

    async fn lookup(&self, id: &str) -> Result<Arc<PageSession>, ApiError> {
        let page = self
            .session(id)
            .await
            .ok_or_else(|| ApiError::UnknownSession(id.to_string()))?;
        page.touch();
        Ok(page)
    }
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("classification failed")]
    Inference,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownSession(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Inference => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

// Minijinja Environment setup
fn create_minijinja_env(template_dir: PathBuf) -> AutoReloader {
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(&template_dir));
        // Watch the templates directory for changes
        notifier.watch_path(&template_dir, true);
        Ok(env)
    })
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, (StatusCode, Html<String>)> {
    let session = state.open_session().await;

    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                tmpl.render(minijinja::context! {
                    title => APP_TITLE,
                    session_id => session.id(),
                })
            })
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Internal Server Error: {}", e)),
            )
        })
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub entry: TranscriptEntry,
    /// Rendered Markdown for bot text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TranscriptView {
    pub loading: bool,
    pub entries: Vec<EntryView>,
}

fn transcript_view(chat: &ChatWidget) -> TranscriptView {
    let entries = chat
        .entries()
        .into_iter()
        .map(|entry| {
            let html = match &entry.message {
                ChatMessage::BotText { text } => Some(markdown_to_html(text)),
                _ => None,
            };
            EntryView { entry, html }
        })
        .collect();

    TranscriptView {
        loading: chat.is_loading(),
        entries,
    }
}

async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TranscriptView>, ApiError> {
    let page = state.lookup(&id).await?;
    Ok(Json(transcript_view(&page.chat)))
}

async fn post_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<TranscriptView>, ApiError> {
    let page = state.lookup(&id).await?;
    page.chat.send_turn(&request.text).await;
    Ok(Json(transcript_view(&page.chat)))
}

async fn get_predictions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PredictionView>, ApiError> {
    let page = state.lookup(&id).await?;
    Ok(Json(page.predictor.view()))
}

async fn post_prediction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<PredictionView>, ApiError> {
    let page = state.lookup(&id).await?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("image") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            upload = Some(bytes);
            break;
        }
    }
    let bytes = upload.ok_or_else(|| ApiError::BadRequest("missing `image` field".to_string()))?;

    match page.predictor.submit_image(&bytes).await {
        Ok(_) => Ok(Json(page.predictor.view())),
        Err(PredictError::Decode(e)) => {
            warn!(session = %id, "Rejected upload: {}", e);
            Err(ApiError::BadRequest("upload is not a readable image".to_string()))
        }
        Err(PredictError::Inference(_)) => Err(ApiError::Inference),
    }
}

async fn close_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    match state.sessions.write().await.remove(&id) {
        Some(_) => {
            info!(session = %id, "Page session closed");
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

pub fn build_router(state: AppState, static_dir: PathBuf) -> Router {
    // Serve static files from the configured directory
    let static_files_service = ServeDir::new(static_dir).not_found_service(tower::service_fn(
        |_req: Request| async {
            Ok::<_, Infallible>((StatusCode::NOT_FOUND, "Not Found").into_response())
        },
    ));

    Router::new()
        .route("/", get(index_handler))
        .route("/api/sessions/:id", delete(close_session))
        .route("/api/sessions/:id/chat", get(get_chat).post(post_chat))
        .route(
            "/api/sessions/:id/predictions",
            get(get_predictions)
                .post(post_prediction)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http()) // Add request logging
}

pub async fn start_web_server(
    config: ServerConfig,
    dialogue: Arc<dyn DialogueClient>,
    model: ModelHandle,
) -> Result<()> {
    let state = AppState::new(&config, dialogue, model);
    let sweeper = state.spawn_session_sweeper();
    let app = build_router(state, config.static_dir.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Web server listening on http://{}", addr);

    // Bind using tokio::net::TcpListener
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    let served = serve(listener, app.into_make_service())
        .await
        .context("Web server failed");
    sweeper.abort();
    served
}
