use shared::{domain::DatasetId, protocol::Record};

/// One-time latched column list for a dataset.
///
/// The first non-empty list wins and is kept until [`ColumnCache::reset`] moves the cache
/// to another dataset.
#[derive(Debug, Clone)]
pub struct ColumnCache {
    dataset_id: DatasetId,
    columns: Option<Vec<String>>,
    fetch_attempted: bool,
}

impl ColumnCache {
    pub fn new(dataset_id: DatasetId) -> Self {
        Self {
            dataset_id,
            columns: None,
            fetch_attempted: false,
        }
    }

    pub fn dataset_id(&self) -> DatasetId {
        self.dataset_id
    }

    pub fn reset(&mut self, dataset_id: DatasetId) {
        *self = Self::new(dataset_id);
    }

    pub fn is_latched(&self) -> bool {
        self.columns.is_some()
    }

    /// True once a fetch was tried or a list latched; further lazy loads are skipped.
    pub fn is_settled(&self) -> bool {
        self.fetch_attempted || self.is_latched()
    }

    pub fn mark_fetch_attempted(&mut self) {
        self.fetch_attempted = true;
    }

    /// Latches `columns` unless a list is already held. Returns whether it latched.
    pub fn latch(&mut self, columns: Vec<String>) -> bool {
        if self.columns.is_some() || columns.is_empty() {
            return false;
        }
        self.columns = Some(columns);
        true
    }

    /// Latches the keys of the first row, if any.
    pub fn latch_from_rows(&mut self, rows: &[Record]) -> bool {
        match rows.first() {
            Some(row) => self.latch(row.keys().cloned().collect()),
            None => false,
        }
    }

    pub fn columns(&self) -> &[String] {
        self.columns.as_deref().unwrap_or_default()
    }
}
