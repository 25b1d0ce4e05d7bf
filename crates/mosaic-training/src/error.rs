use mosaic_abstraction::ComponentError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("missing config section '{section}'")]
    MissingConfigSection { section: String },

    #[error("unknown {section} type '{type_name}' (registered: {})", available.join(", "))]
    UnknownComponentType { section: String, type_name: String, available: Vec<String> },

    #[error("config conflict in '{section}': argument '{key}' is set in the config and by the caller with different values")]
    ConfigConflict { section: String, key: String },

    #[error("invalid arguments for {section} type '{type_name}': {reason}")]
    InvalidArgs { section: String, type_name: String, reason: String },

    #[error("duplicate registration of {kind} '{name}'")]
    DuplicateRegistration { kind: String, name: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch in {component}: {reason}")]
    ShapeMismatch { component: String, reason: String },

    #[error("incompatible resume: {0}")]
    IncompatibleResume(String),

    #[error("corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("numeric instability at step {step}: {reason}")]
    NumericInstability { step: u64, reason: String },

    #[error("training diverged: {failures} consecutive non-finite batches (threshold {threshold})")]
    DivergedTraining { failures: u32, threshold: u32 },

    #[error("storage failure writing {}: {source}", path.display())]
    StorageFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("{component} failed: {source}")]
    Component {
        component: String,
        #[source]
        source: ComponentError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl TrainingError {
    /// Wraps a collaborator error, keeping credential and shape failures in
    /// their own variants.
    pub fn component(component: impl Into<String>, source: ComponentError) -> Self {
        let component = component.into();
        match source {
            ComponentError::MissingCredentials(reason) => Self::MissingCredentials(reason),
            ComponentError::ShapeMismatch(reason) => Self::ShapeMismatch { component, reason },
            source => Self::Component { component, source },
        }
    }

    /// Errors raised while reading the config or building components, before
    /// any training step.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::MissingConfigSection { .. }
                | Self::UnknownComponentType { .. }
                | Self::ConfigConflict { .. }
                | Self::InvalidArgs { .. }
                | Self::DuplicateRegistration { .. }
                | Self::InvalidConfig(_)
                | Self::ShapeMismatch { .. }
                | Self::MissingCredentials(_)
                | Self::Toml(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_lists_registered_names() {
        let err = TrainingError::UnknownComponentType {
            section: "optimizer".to_string(),
            type_name: "Adamm".to_string(),
            available: vec!["AdamW".to_string(), "SGD".to_string()],
        };
        assert_eq!(err.to_string(), "unknown optimizer type 'Adamm' (registered: AdamW, SGD)");
        assert!(err.is_construction_error());
    }

    #[test]
    fn test_component_keeps_credentials_variant() {
        let err = TrainingError::component("tracker", ComponentError::MissingCredentials("no token".to_string()));
        assert!(matches!(err, TrainingError::MissingCredentials(_)));

        let err = TrainingError::component("model", ComponentError::ShapeMismatch("dim".to_string()));
        assert!(matches!(err, TrainingError::ShapeMismatch { .. }));

        let err = TrainingError::component("data_loader", ComponentError::Dataset("empty".to_string()));
        assert!(!err.is_construction_error());
    }
}
