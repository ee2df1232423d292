use thiserror::Error;

/// Failure of a single generation call.
///
/// Only `Transport` is an infrastructure problem. The output variants mean the
/// backend answered but the answer was unusable, which usually points at the
/// prompt or the model rather than the network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    #[error("model returned no text")]
    EmptyOutput,

    #[error("model response contained no image data")]
    NoImageData,
}

impl GenerationError {
    /// Short label used in logs and batch events.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Configuration(_) => "configuration",
            GenerationError::Transport(_) => "transport",
            GenerationError::MalformedOutput(_) => "malformed_output",
            GenerationError::EmptyOutput => "empty_output",
            GenerationError::NoImageData => "no_image_data",
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, GenerationError::Transport(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, GenerationError::Configuration(_))
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        GenerationError::Transport(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("episode number {number} must be greater than {current_max}")]
    InvalidEpisodeNumber { number: u32, current_max: u32 },

    #[error("episode number {0} appears more than once")]
    DuplicateEpisodeNumber(u32),

    #[error("episode {0} is not in the plan")]
    UnknownEpisode(u32),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("a batch run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Configuration(GenerationError),

    #[error("batch aborted by an unexpected error: {0:#}")]
    Fatal(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StudioError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("no character with id {0}")]
    UnknownCharacter(String),

    #[error("no scene with id {0}")]
    UnknownScene(String),

    #[error("an image is already being generated for {0}")]
    PortraitInFlight(String),

    #[error("the episode plan is empty")]
    EmptyPlan,

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

pub type StudioResult<T> = Result<T, StudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(GenerationError::Transport("x".into()).kind(), "transport");
        assert_eq!(GenerationError::EmptyOutput.kind(), "empty_output");
        assert_eq!(GenerationError::NoImageData.kind(), "no_image_data");
        assert_eq!(
            GenerationError::MalformedOutput("x".into()).kind(),
            "malformed_output"
        );
    }

    #[test]
    fn test_only_transport_is_transport() {
        assert!(GenerationError::Transport("timeout".into()).is_transport());
        assert!(!GenerationError::EmptyOutput.is_transport());
        assert!(!GenerationError::Configuration("no key".into()).is_transport());
    }

    #[test]
    fn test_invalid_episode_number_message() {
        let err = PlanError::InvalidEpisodeNumber {
            number: 3,
            current_max: 5,
        };
        assert_eq!(err.to_string(), "episode number 3 must be greater than 5");
    }
}
