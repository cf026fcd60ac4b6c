use thiserror::Error;

/// Fatal conditions raised by the block runner and its components.
///
/// Everything is propagated through `anyhow::Result`; callers that need to
/// tell the categories apart can `downcast_ref::<RunnerError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// Invalid block geometry or runner configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Kernel build, lookup, launch or transfer failure.
    #[error("device error: {0}")]
    Device(String),

    /// A field handle that was not issued by this field store.
    #[error("unknown field handle: {0}")]
    UnknownField(usize),

    /// `run()` called on a runner that already left the `Created` state.
    #[error("invalid runner state: {0}")]
    State(String),

    /// Neighbor channel failure (peer hung up, message size mismatch).
    #[error("transport error: {0}")]
    Transport(String),
}

impl RunnerError {
    pub fn config(msg: impl Into<String>) -> Self {
        RunnerError::Config(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        RunnerError::Device(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        RunnerError::Transport(msg.into())
    }
}
