//! Execution options for pipeline runs.

/// Runtime execution options (not part of pipeline YAML config).
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Stop polling after this many messages, then drain and return.
    pub max_messages: Option<u64>,
}

impl ExecutionOptions {
    /// How many more messages may be polled after `polled` so far.
    #[must_use]
    pub fn remaining(&self, polled: u64) -> Option<u64> {
        self.max_messages.map(|max| max.saturating_sub(polled))
    }
}
