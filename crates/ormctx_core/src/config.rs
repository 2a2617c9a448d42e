//! Persistence context configuration.

/// Configuration for a [`PersistenceContext`](crate::PersistenceContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Initial capacity of lazily created indices.
    pub initial_capacity: usize,

    /// Whether entities and proxies loaded into the context start read-only.
    pub default_read_only: bool,

    /// Whether keys and collections are queued for batch fetching.
    pub batch_fetch_enabled: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 8,
            default_read_only: false,
            batch_fetch_enabled: true,
        }
    }
}

impl ContextConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial capacity of lazily created indices.
    #[must_use]
    pub const fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Sets the default read-only mode.
    #[must_use]
    pub const fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    /// Enables or disables batch-fetch queueing.
    #[must_use]
    pub const fn batch_fetch_enabled(mut self, value: bool) -> Self {
        self.batch_fetch_enabled = value;
        self
    }
}
