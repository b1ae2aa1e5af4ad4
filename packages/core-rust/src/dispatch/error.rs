//! Errors raised by interceptors and by chain registration.

use std::any::Any;

/// Error produced by an interceptor. Short-circuits the rest of the chain.
///
/// Cloneable so the same error can be handed to the terminal callback and
/// stored on a `fail` event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterceptError {
    /// The interceptor reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The interceptor panicked; the payload message is preserved.
    #[error("interceptor panicked: {0}")]
    Panicked(String),
}

impl InterceptError {
    /// Shorthand for [`InterceptError::Failed`].
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// The bare message without the variant prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Failed(m) | Self::Panicked(m) => m,
        }
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

impl From<anyhow::Error> for InterceptError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(format!("{e:#}"))
    }
}

/// Registration misuse detected synchronously.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// No event was selected (the event name was empty).
    #[error("no event selected: call pre, once, on or post with an event name before registering an interceptor")]
    MissingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_displays_bare_message() {
        assert_eq!(InterceptError::msg("x").to_string(), "x");
        assert_eq!(InterceptError::msg("x").message(), "x");
    }

    #[test]
    fn anyhow_context_chain_is_kept() {
        let err = anyhow::anyhow!("disk full").context("write failed");
        assert_eq!(
            InterceptError::from(err),
            InterceptError::Failed("write failed: disk full".into())
        );
    }

    #[test]
    fn panic_payloads_are_stringified() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            InterceptError::from_panic(boxed.as_ref()),
            InterceptError::Panicked("boom".into())
        );
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(InterceptError::from_panic(boxed.as_ref()).message(), "bang");
    }
}
