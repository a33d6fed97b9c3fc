//! Engine runtime options.

/// Engine options that do not affect consensus.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Log every fill and removal at info level.
    pub verbose: bool,
    /// Depth returned by level queries when the caller does not cap it.
    pub default_book_depth: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            default_book_depth: 50,
        }
    }
}

/// Whether operations are being admitted speculatively (rate limited, discardable)
/// or executed as part of an agreed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    #[default]
    Speculative,
    Finalize,
}
