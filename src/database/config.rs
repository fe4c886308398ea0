//! # Database Configuration
//!
//! Tunables threaded through [`Database`](super::Database) construction. The
//! store-level knobs (indent, read-chunk size) live in
//! [`StoreConfig`](crate::store::StoreConfig); this wrapper adds the
//! database-level batch limit for index builds.

use crate::store::StoreConfig;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Formatting and read-buffer settings of the data file. The index file
    /// derives from this with indent pinned to 0.
    pub store: StoreConfig,
    /// Maximum `(value, offset)` items buffered per field during an index
    /// build before the batch is flushed into the skip list.
    pub batch_limit: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            batch_limit: 1_000_000,
        }
    }
}

impl DatabaseConfig {
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    pub fn with_indent(mut self, indent: usize) -> Self {
        self.store.indent = indent;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.store.indent, 2);
        assert_eq!(config.batch_limit, 1_000_000);
    }

    #[test]
    fn batch_limit_has_a_floor() {
        assert_eq!(DatabaseConfig::default().with_batch_limit(0).batch_limit, 1);
    }
}
