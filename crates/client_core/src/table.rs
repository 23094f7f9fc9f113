//! Row-browsing state: filters, search, sort and pagination over one dataset.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use shared::{
    domain::{DatasetId, SortDirection},
    protocol::{QueryRequest, QueryResponse, Record},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    columns::ColumnCache,
    error::QueryError,
    filter_state::FilterState,
    sequencer::{Sequencer, Ticket},
    service::QueryService,
    sync_bus::SyncBus,
    QueryOutcome,
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortState {
    pub key: Option<String>,
    pub direction: SortDirection,
}

impl SortState {
    /// Same key flips direction; a new key starts ascending.
    pub fn toggled(&self, column: &str) -> Self {
        match self.key.as_deref() {
            Some(key) if key == column => Self {
                key: self.key.clone(),
                direction: self.direction.toggled(),
            },
            _ => Self {
                key: Some(column.to_string()),
                direction: SortDirection::Ascending,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageChange {
    Absolute(u32),
    Relative(i64),
}

impl PageChange {
    pub fn next() -> Self {
        PageChange::Relative(1)
    }

    pub fn previous() -> Self {
        PageChange::Relative(-1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationState {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u32,
}

impl PaginationState {
    pub fn new(page_size: u32) -> Self {
        Self {
            page: 1,
            page_size: page_size.max(1),
            total: 0,
            total_pages: 0,
        }
    }

    pub fn last_page(&self) -> u32 {
        self.total_pages.max(1)
    }

    /// Target page for `change`, or `None` when it falls outside `1..=last_page`.
    pub fn resolve(&self, change: PageChange) -> Option<u32> {
        let target = match change {
            PageChange::Absolute(page) => i64::from(page),
            PageChange::Relative(delta) => i64::from(self.page).saturating_add(delta),
        };
        if target < 1 || target > i64::from(self.last_page()) {
            return None;
        }
        u32::try_from(target).ok()
    }

    /// 1-based inclusive row range shown on the current page; `(0, 0)` when empty.
    pub fn window(&self) -> (u64, u64) {
        if self.total == 0 {
            return (0, 0);
        }
        let page_size = u64::from(self.page_size);
        let start = u64::from(self.page - 1) * page_size + 1;
        let end = (u64::from(self.page) * page_size).min(self.total);
        (start.min(self.total), end)
    }

    fn update_totals(&mut self, total: u64, total_pages: u32) -> bool {
        self.total = total;
        self.total_pages = total_pages;
        let clamped = self.page.clamp(1, self.last_page());
        let changed = clamped != self.page;
        self.page = clamped;
        changed
    }
}

#[derive(Debug, Clone)]
pub enum TableEvent {
    RowsUpdated(PaginationState),
    QueryFailed(QueryError),
    ColumnsLoaded(Vec<String>),
    DatasetChanged(DatasetId),
}

/// Read-only view of the table for rendering.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub dataset_id: DatasetId,
    pub rows: Vec<Record>,
    pub columns: Vec<String>,
    pub filters: FilterState,
    pub search: String,
    pub sort: SortState,
    pub pagination: PaginationState,
    pub loading: bool,
    pub error: Option<QueryError>,
    pub resolved_at: Option<DateTime<Utc>>,
}

struct TableState {
    filters: FilterState,
    search: String,
    sort: SortState,
    pagination: PaginationState,
    rows: Vec<Record>,
    columns: ColumnCache,
    sequencer: Sequencer,
    in_flight: Option<Ticket>,
    last_error: Option<QueryError>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TableState {
    fn new(dataset_id: DatasetId, page_size: u32) -> Self {
        Self {
            filters: FilterState::new(),
            search: String::new(),
            sort: SortState::default(),
            pagination: PaginationState::new(page_size),
            rows: Vec::new(),
            columns: ColumnCache::new(dataset_id),
            sequencer: Sequencer::default(),
            in_flight: None,
            last_error: None,
            resolved_at: None,
        }
    }

    fn dataset_id(&self) -> DatasetId {
        self.columns.dataset_id()
    }

    fn request(&self) -> QueryRequest {
        QueryRequest {
            dataset_id: self.dataset_id(),
            filters: self.filters.to_wire(),
            search_term: (!self.search.is_empty()).then(|| self.search.clone()),
            page: self.pagination.page,
            page_size: self.pagination.page_size,
            sort_by: self.sort.key.clone(),
            sort_order: self.sort.direction,
        }
    }

    fn issue(&mut self) -> (Ticket, QueryRequest) {
        let ticket = self.sequencer.issue();
        self.in_flight = Some(ticket);
        (ticket, self.request())
    }

    fn display_columns(&self) -> Vec<String> {
        if self.columns.is_latched() {
            return self.columns.columns().to_vec();
        }
        self.rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }
}

enum RowStep {
    Done(Result<QueryOutcome, QueryError>),
    Requery(Ticket, QueryRequest),
}

/// Owns the table's browsing state and keeps it in step with the [`QueryService`].
///
/// Every mutation that changes the row query issues exactly one request; only the response to
/// the most recently issued request may update the visible rows. Filter changes are published
/// on the [`SyncBus`] before the row query is sent, in the order they were staged.
pub struct TableController {
    service: Arc<dyn QueryService>,
    bus: Arc<SyncBus>,
    state: Mutex<TableState>,
    // Held from staging a filter change until its publication returns.
    publication: Mutex<()>,
    events: broadcast::Sender<TableEvent>,
}

impl TableController {
    pub fn new(
        service: Arc<dyn QueryService>,
        bus: Arc<SyncBus>,
        dataset_id: DatasetId,
    ) -> Arc<Self> {
        Self::with_page_size(service, bus, dataset_id, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(
        service: Arc<dyn QueryService>,
        bus: Arc<SyncBus>,
        dataset_id: DatasetId,
        page_size: u32,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            service,
            bus,
            state: Mutex::new(TableState::new(dataset_id, page_size)),
            publication: Mutex::new(()),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_publication(&self) -> MutexGuard<'_, ()> {
        self.publication
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TableEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> TableSnapshot {
        let state = self.lock();
        TableSnapshot {
            dataset_id: state.dataset_id(),
            rows: state.rows.clone(),
            columns: state.display_columns(),
            filters: state.filters.clone(),
            search: state.search.clone(),
            sort: state.sort.clone(),
            pagination: state.pagination,
            loading: state.in_flight.is_some(),
            error: state.last_error.clone(),
            resolved_at: state.resolved_at,
        }
    }

    pub fn filters(&self) -> FilterState {
        self.lock().filters.clone()
    }

    pub fn pagination(&self) -> PaginationState {
        self.lock().pagination
    }

    /// Latched column list, or the first row's keys until one latches.
    pub fn display_columns(&self) -> Vec<String> {
        self.lock().display_columns()
    }

    /// The request the current state would issue.
    pub fn current_request(&self) -> QueryRequest {
        self.lock().request()
    }

    /// Sets or clears (`None` / empty) the filter on `column`.
    pub async fn set_filter(
        &self,
        column: &str,
        value: Option<&str>,
    ) -> Result<QueryOutcome, QueryError> {
        let (ticket, request) = {
            let _publication = self.lock_publication();
            let staged = {
                let mut state = self.lock();
                let filters = state.filters.with(column, value);
                if filters == state.filters {
                    None
                } else {
                    state.filters = filters.clone();
                    state.pagination.page = 1;
                    let (ticket, request) = state.issue();
                    Some((ticket, request, filters))
                }
            };

            let Some((ticket, request, filters)) = staged else {
                return Ok(QueryOutcome::Unchanged);
            };
            self.bus.publish(filters);
            (ticket, request)
        };
        self.run_row_query(ticket, request).await
    }

    pub async fn clear_filters(&self) -> Result<QueryOutcome, QueryError> {
        let (ticket, request) = {
            let _publication = self.lock_publication();
            let staged = {
                let mut state = self.lock();
                if state.filters.is_empty() {
                    None
                } else {
                    state.filters = FilterState::new();
                    state.pagination.page = 1;
                    Some(state.issue())
                }
            };

            let Some(issued) = staged else {
                return Ok(QueryOutcome::Unchanged);
            };
            self.bus.publish(FilterState::new());
            issued
        };
        self.run_row_query(ticket, request).await
    }

    pub async fn set_search_term(&self, term: &str) -> Result<QueryOutcome, QueryError> {
        let staged = {
            let mut state = self.lock();
            if state.search == term {
                None
            } else {
                state.search = term.to_string();
                state.pagination.page = 1;
                Some(state.issue())
            }
        };

        match staged {
            Some((ticket, request)) => self.run_row_query(ticket, request).await,
            None => Ok(QueryOutcome::Unchanged),
        }
    }

    pub async fn set_sort(&self, column: &str) -> Result<QueryOutcome, QueryError> {
        let (ticket, request) = {
            let mut state = self.lock();
            state.sort = state.sort.toggled(column);
            state.pagination.page = 1;
            state.issue()
        };
        self.run_row_query(ticket, request).await
    }

    /// Moves to another page. Targets outside the known page range are ignored.
    pub async fn set_page(&self, change: PageChange) -> Result<QueryOutcome, QueryError> {
        let staged = {
            let mut state = self.lock();
            match state.pagination.resolve(change) {
                Some(page) if page != state.pagination.page => {
                    state.pagination.page = page;
                    Some(state.issue())
                }
                Some(_) => None,
                None => {
                    debug!(
                        ?change,
                        last_page = state.pagination.last_page(),
                        "page change out of range"
                    );
                    None
                }
            }
        };

        match staged {
            Some((ticket, request)) => self.run_row_query(ticket, request).await,
            None => Ok(QueryOutcome::Unchanged),
        }
    }

    /// Re-issues the current row query, e.g. after a failure.
    pub async fn refresh(&self) -> Result<QueryOutcome, QueryError> {
        let (ticket, request) = self.lock().issue();
        self.run_row_query(ticket, request).await
    }

    /// Switches to another dataset, dropping everything tied to the old one.
    /// Returns false when `dataset_id` is already current.
    /// Not callable from a [`SyncBus`] handler; publications from this table are serialized.
    pub fn set_dataset(&self, dataset_id: DatasetId) -> bool {
        let _publication = self.lock_publication();
        let cleared_filters = {
            let mut state = self.lock();
            if state.dataset_id() == dataset_id {
                return false;
            }
            let had_filters = !state.filters.is_empty();
            let page_size = state.pagination.page_size;
            state.sequencer.invalidate();
            state.columns.reset(dataset_id);
            state.filters = FilterState::new();
            state.search.clear();
            state.sort = SortState::default();
            state.pagination = PaginationState::new(page_size);
            state.rows.clear();
            state.in_flight = None;
            state.last_error = None;
            state.resolved_at = None;
            had_filters
        };

        info!(%dataset_id, "table switched dataset");
        if cleared_filters {
            self.bus.publish(FilterState::new());
        }
        let _ = self.events.send(TableEvent::DatasetChanged(dataset_id));
        true
    }

    /// Fetches the column list once per dataset. An empty list is kept as "not latched" so
    /// the first non-empty row response can still supply the columns.
    pub async fn load_columns(&self, dataset_id: DatasetId) -> Result<Vec<String>, QueryError> {
        self.set_dataset(dataset_id);
        {
            let state = self.lock();
            if state.columns.is_settled() {
                return Ok(state.display_columns());
            }
        }

        let response = self.service.get_columns(dataset_id).await?;

        let (columns, latched) = {
            let mut state = self.lock();
            if state.dataset_id() != dataset_id {
                debug!(%dataset_id, "discarding column list for previous dataset");
                return Ok(Vec::new());
            }
            state.columns.mark_fetch_attempted();
            let latched = state.columns.latch(response.columns);
            (state.display_columns(), latched)
        };

        if latched {
            let _ = self.events.send(TableEvent::ColumnsLoaded(columns.clone()));
        } else if columns.is_empty() {
            debug!(%dataset_id, "column list empty; waiting for row data");
        }
        Ok(columns)
    }

    async fn run_row_query(
        &self,
        mut ticket: Ticket,
        mut request: QueryRequest,
    ) -> Result<QueryOutcome, QueryError> {
        loop {
            debug!(
                ticket = ticket.value(),
                page = request.page,
                filters = request.filters.len(),
                "issuing row query"
            );
            let result = self.service.query_rows(&request).await;
            match self.resolve_rows(ticket, request.page, result) {
                RowStep::Done(outcome) => return outcome,
                RowStep::Requery(next_ticket, next_request) => {
                    ticket = next_ticket;
                    request = next_request;
                }
            }
        }
    }

    fn resolve_rows(
        &self,
        ticket: Ticket,
        requested_page: u32,
        result: Result<QueryResponse, QueryError>,
    ) -> RowStep {
        let mut state = self.lock();
        if !state.sequencer.is_current(ticket) {
            debug!(ticket = ticket.value(), "discarding stale row response");
            return RowStep::Done(Ok(QueryOutcome::Stale));
        }
        state.in_flight = None;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    dataset_id = %state.dataset_id(),
                    error = %err,
                    "row query failed; keeping previous rows"
                );
                state.last_error = Some(err.clone());
                drop(state);
                let _ = self.events.send(TableEvent::QueryFailed(err.clone()));
                return RowStep::Done(Err(err));
            }
        };

        let clamped = state
            .pagination
            .update_totals(response.total, response.total_pages);
        if clamped && state.pagination.page != requested_page {
            debug!(
                requested_page,
                page = state.pagination.page,
                "page out of range after update; fetching clamped page"
            );
            let (ticket, request) = state.issue();
            return RowStep::Requery(ticket, request);
        }

        let latched = state.columns.latch_from_rows(&response.data);
        state.rows = response.data;
        state.last_error = None;
        state.resolved_at = Some(Utc::now());
        let pagination = state.pagination;
        let columns = latched.then(|| state.columns.columns().to_vec());
        drop(state);

        if let Some(columns) = columns {
            let _ = self.events.send(TableEvent::ColumnsLoaded(columns));
        }
        let _ = self.events.send(TableEvent::RowsUpdated(pagination));
        RowStep::Done(Ok(QueryOutcome::Applied))
    }
}

#[cfg(test)]
#[path = "tests/table_tests.rs"]
mod tests;
