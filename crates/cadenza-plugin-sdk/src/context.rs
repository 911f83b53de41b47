use std::any::Any;
use std::fmt;

/// Opaque handle passed to module activation callbacks.
///
/// The bank never inspects the payload; it exists so that the subsystem
/// acquiring a module can hand it whatever state the activation needs (a
/// demuxer passes its stream, a filter its frame format, and so on).
#[derive(Default)]
pub struct ActivationContext {
    payload: Option<Box<dyn Any + Send + Sync>>,
}

impl ActivationContext {
    /// An empty context, for callers whose modules need no shared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an arbitrary payload the activated module can downcast to.
    pub fn with_payload<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            payload: Some(Box::new(payload)),
        }
    }

    /// Downcast the payload, if one was provided and the type matches.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref())
    }
}

impl fmt::Debug for ActivationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationContext")
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}
