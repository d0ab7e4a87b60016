use thiserror::Error;

/// Fatal conditions a refinement run can surface.
///
/// Duplicate-revision is deliberately absent: it is a recoverable condition
/// handled by the controller's bounded retry, never an error.
#[derive(Debug, Error)]
pub enum RunError {
    /// A required option or credential is missing or inconsistent.
    #[error("{0}")]
    Configuration(String),

    /// The requested backend identifier is not in the registry.
    #[error("Unknown model: {requested}. Available models: {}", .available.join(", "))]
    UnknownModel {
        requested: String,
        available: Vec<String>,
    },

    /// The generation backend reported a terminal failure, including
    /// moderation rejections and exhausted transport budgets.
    #[error("image generation failed: {0}")]
    GenerationFailed(String),

    /// A local model was invoked outside its load/unload window.
    #[error("model '{0}' is not loaded")]
    NotLoaded(String),
}
