use evergreen_core::StreamError;
use evergreen_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum EvergreenError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("duplicate {direction} field: {name}")]
    DuplicateField { direction: &'static str, name: String },

    #[error("invalid config: {0}")]
    Config(String),
}

impl EvergreenError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.error_kind(),
            Self::Stream(e) => e.error_kind(),
            Self::DuplicateField { .. } => "duplicate_field",
            Self::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_delegate_to_inner_errors() {
        let e: EvergreenError = TransportError::NotConnected.into();
        assert_eq!(e.error_kind(), "not_connected");
        let e: EvergreenError = StreamError::Closed.into();
        assert_eq!(e.error_kind(), StreamError::Closed.error_kind());
        let e = EvergreenError::DuplicateField { direction: "input", name: "prompt".into() };
        assert_eq!(e.to_string(), "duplicate input field: prompt");
    }
}
