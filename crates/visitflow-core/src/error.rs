use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisitflowError {
    // Workflow definition errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    // Delivery errors
    #[error("Delivery failed: {action}: {message}")]
    Delivery { action: String, message: String },

    #[error("Delivery rejected: {action}: {message}")]
    DeliveryRejected { action: String, message: String },

    #[error("Delivery exhausted after {attempts} attempts: {action}: {reason}")]
    DeliveryExhausted {
        action: String,
        attempts: u32,
        reason: String,
    },

    #[error("Custom code failed: {0}")]
    CustomCode(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VisitflowError {
    pub fn delivery(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Delivery { .. } | Self::Http(_) | Self::Io(_) | Self::Database(_) | Self::Queue(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VisitflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(VisitflowError::delivery("Webhook", "503").is_transient());
        assert!(VisitflowError::Http("connection reset".into()).is_transient());
        assert!(!VisitflowError::DeliveryRejected {
            action: "Webhook".into(),
            message: "404".into()
        }
        .is_transient());
        assert!(!VisitflowError::NotFound("wf".into()).is_transient());
        assert!(!VisitflowError::CustomCode("boom".into()).is_transient());
    }

    #[test]
    fn test_display() {
        let e = VisitflowError::DeliveryExhausted {
            action: "Webhook".into(),
            attempts: 5,
            reason: "Webhook failed: 500".into(),
        };
        assert_eq!(
            e.to_string(),
            "Delivery exhausted after 5 attempts: Webhook: Webhook failed: 500"
        );
    }
}
