// Defaults and fixed user-facing strings. Anything deployment specific is overridable
// through the CLI flags / environment variables declared in `main.rs`.

use std::time::Duration;

/// Voiceflow general runtime; each session talks to `/state/user/{id}/interact`.
pub const DEFAULT_RUNTIME_URL: &str = "https://general-runtime.voiceflow.com";

pub const DEFAULT_MODEL_URL: &str = "model/model.json";
pub const DEFAULT_METADATA_URL: &str = "model/metadata.json";

/// Teachable Machine image models are trained on 224x224 crops.
pub const DEFAULT_IMAGE_SIZE: u32 = 224;

pub const DEFAULT_PORT: u16 = 9900;
pub const DEFAULT_TEMPLATE_DIR: &str = "templates";
pub const DEFAULT_STATIC_DIR: &str = "static";

/// Pause between publishing bars at 0% and at their target width.
pub const DEFAULT_ANIMATION_DELAY: Duration = Duration::from_millis(100);

/// Page sessions untouched for this long are dropped from the registry.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

pub const NETWORK_ERROR_NOTICE: &str = "Network error. Please try again later.";
pub const UNEXPECTED_FORMAT_NOTICE: &str = "Unexpected response format from Voiceflow.";

pub const APP_TITLE: &str = "Weld Mentor";

/// Replaces axum's 2 MB default body limit on the upload route.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
