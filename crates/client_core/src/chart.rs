//! Aggregate view that follows the table's filters.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Aggregation, Axis, ChartType, DatasetId},
    protocol::{AggregateRequest, AggregateResponse},
};
use tokio::{runtime::Handle, sync::broadcast};
use tracing::{debug, info, warn};

use crate::{
    columns::ColumnCache,
    error::QueryError,
    filter_state::FilterState,
    sequencer::{Sequencer, Ticket},
    service::QueryService,
    sync_bus::{Subscription, SyncBus},
    QueryOutcome,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartConfig {
    pub chart_type: ChartType,
    pub x_axis: Option<String>,
    pub y_axis: Option<String>,
    pub aggregation: Aggregation,
}

impl ChartConfig {
    /// The aggregate request this configuration issues, or `None` while no x axis is chosen.
    ///
    /// Pie charts never carry a y axis and always count, whatever the stored y axis and
    /// aggregation are.
    pub fn request(
        &self,
        dataset_id: DatasetId,
        filters: &FilterState,
    ) -> Option<AggregateRequest> {
        let x_axis = self.x_axis.clone().filter(|axis| !axis.is_empty())?;
        let (y_axis, aggregation) = if self.chart_type.uses_y_axis() {
            (
                self.y_axis.clone().filter(|axis| !axis.is_empty()),
                self.aggregation,
            )
        } else {
            (None, Aggregation::Count)
        };
        Some(AggregateRequest {
            dataset_id,
            chart_type: self.chart_type,
            x_axis,
            y_axis,
            aggregation,
            filters: filters.to_wire(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum ChartEvent {
    ChartUpdated(AggregateResponse),
    QueryFailed(QueryError),
    ColumnsLoaded(Vec<String>),
    Unconfigured,
}

#[derive(Debug, Clone)]
pub struct ChartSnapshot {
    pub dataset_id: DatasetId,
    pub config: ChartConfig,
    pub filters: FilterState,
    pub columns: Vec<String>,
    pub data: Option<AggregateResponse>,
    pub loading: bool,
    pub error: Option<QueryError>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ChartSnapshot {
    pub fn is_configured(&self) -> bool {
        self.config.x_axis.as_deref().is_some_and(|axis| !axis.is_empty())
    }
}

struct ChartState {
    config: ChartConfig,
    filters: FilterState,
    columns: ColumnCache,
    sequencer: Sequencer,
    in_flight: Option<Ticket>,
    data: Option<AggregateResponse>,
    last_error: Option<QueryError>,
    resolved_at: Option<DateTime<Utc>>,
}

impl ChartState {
    fn effective_request(&self) -> Option<AggregateRequest> {
        self.config.request(self.columns.dataset_id(), &self.filters)
    }
}

enum Staged {
    Unchanged,
    Unconfigured,
    Issue(Ticket, AggregateRequest),
}

/// Owns the chart configuration and re-queries the aggregate whenever the effective request
/// changes, including when the table publishes new filters.
pub struct ChartController {
    service: Arc<dyn QueryService>,
    state: Mutex<ChartState>,
    subscription: Mutex<Option<Subscription>>,
    events: broadcast::Sender<ChartEvent>,
}

impl ChartController {
    pub fn new(service: Arc<dyn QueryService>, dataset_id: DatasetId) -> Arc<Self> {
        Self::with_config(service, dataset_id, ChartConfig::default())
    }

    pub fn with_config(
        service: Arc<dyn QueryService>,
        dataset_id: DatasetId,
        config: ChartConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            service,
            state: Mutex::new(ChartState {
                config,
                filters: FilterState::new(),
                columns: ColumnCache::new(dataset_id),
                sequencer: Sequencer::default(),
                in_flight: None,
                data: None,
                last_error: None,
                resolved_at: None,
            }),
            subscription: Mutex::new(None),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChartState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChartEvent> {
        self.events.subscribe()
    }

    /// Follows filter publications on `bus`, starting from its latest snapshot. Replaces any
    /// earlier attachment; the subscription ends when the controller is dropped.
    pub fn attach(self: &Arc<Self>, bus: &Arc<SyncBus>) {
        let controller = Arc::downgrade(self);
        let subscription = bus.subscribe(move |filters| {
            if let Some(controller) = controller.upgrade() {
                controller.on_filter_state_changed(filters);
            }
        });
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        self.on_filter_state_changed(&bus.latest());
    }

    pub fn detach(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn snapshot(&self) -> ChartSnapshot {
        let state = self.lock();
        ChartSnapshot {
            dataset_id: state.columns.dataset_id(),
            config: state.config.clone(),
            filters: state.filters.clone(),
            columns: state.columns.columns().to_vec(),
            data: state.data.clone(),
            loading: state.in_flight.is_some(),
            error: state.last_error.clone(),
            resolved_at: state.resolved_at,
        }
    }

    pub fn config(&self) -> ChartConfig {
        self.lock().config.clone()
    }

    /// The request the current configuration and filters would issue.
    pub fn current_request(&self) -> Option<AggregateRequest> {
        self.lock().effective_request()
    }

    pub async fn set_chart_type(&self, chart_type: ChartType) -> Result<QueryOutcome, QueryError> {
        let staged = self.stage(|state| state.config.chart_type = chart_type);
        self.dispatch(staged).await
    }

    /// Sets (`Some`) or clears (`None`) one axis.
    pub async fn set_axis(
        &self,
        axis: Axis,
        column: Option<&str>,
    ) -> Result<QueryOutcome, QueryError> {
        let column = column.filter(|column| !column.is_empty()).map(str::to_string);
        let staged = self.stage(|state| match axis {
            Axis::X => state.config.x_axis = column,
            Axis::Y => state.config.y_axis = column,
        });
        self.dispatch(staged).await
    }

    pub async fn set_aggregation(
        &self,
        aggregation: Aggregation,
    ) -> Result<QueryOutcome, QueryError> {
        let staged = self.stage(|state| state.config.aggregation = aggregation);
        self.dispatch(staged).await
    }

    /// Re-issues the current aggregate query, e.g. after a failure.
    pub async fn refresh(&self) -> Result<QueryOutcome, QueryError> {
        let staged = {
            let mut state = self.lock();
            match state.effective_request() {
                Some(request) => {
                    let ticket = state.sequencer.issue();
                    state.in_flight = Some(ticket);
                    Staged::Issue(ticket, request)
                }
                None => Staged::Unconfigured,
            }
        };
        self.dispatch(staged).await
    }

    /// Receives a filter snapshot from the bus. A resulting aggregate query runs on the
    /// current tokio runtime; returns whether one was issued.
    pub fn on_filter_state_changed(self: &Arc<Self>, filters: &FilterState) -> bool {
        let staged = self.stage(|state| state.filters = filters.clone());
        match staged {
            Staged::Unchanged => false,
            Staged::Unconfigured => {
                let _ = self.events.send(ChartEvent::Unconfigured);
                false
            }
            Staged::Issue(ticket, request) => self.spawn_query(ticket, request),
        }
    }

    /// Switches to another dataset. Axes and data belong to the old dataset and are cleared.
    pub fn set_dataset(&self, dataset_id: DatasetId) -> bool {
        {
            let mut state = self.lock();
            if state.columns.dataset_id() == dataset_id {
                return false;
            }
            state.sequencer.invalidate();
            state.columns.reset(dataset_id);
            state.config.x_axis = None;
            state.config.y_axis = None;
            state.in_flight = None;
            state.data = None;
            state.last_error = None;
            state.resolved_at = None;
        }
        info!(%dataset_id, "chart switched dataset");
        let _ = self.events.send(ChartEvent::Unconfigured);
        true
    }

    /// Fetches axis columns once per dataset. When columns arrive and no x axis is chosen,
    /// the first column becomes the x axis and the chart is queried. A failure of that query
    /// lands in the snapshot and events; the column list is still returned.
    pub async fn load_columns(&self, dataset_id: DatasetId) -> Result<Vec<String>, QueryError> {
        self.set_dataset(dataset_id);
        {
            let state = self.lock();
            if state.columns.is_settled() {
                return Ok(state.columns.columns().to_vec());
            }
        }

        let response = self.service.get_columns(dataset_id).await?;

        let columns = {
            let mut state = self.lock();
            if state.columns.dataset_id() != dataset_id {
                debug!(%dataset_id, "discarding axis columns for previous dataset");
                return Ok(Vec::new());
            }
            state.columns.mark_fetch_attempted();
            if !state.columns.latch(response.columns) {
                debug!(%dataset_id, "no axis columns available");
                return Ok(state.columns.columns().to_vec());
            }
            state.columns.columns().to_vec()
        };
        let _ = self.events.send(ChartEvent::ColumnsLoaded(columns.clone()));

        let default_axis = columns.first().cloned();
        let staged = self.stage(|state| {
            if state.config.x_axis.is_none() {
                state.config.x_axis = default_axis;
            }
        });
        if let Err(err) = self.dispatch(staged).await {
            debug!(%dataset_id, error = %err, "default axis query failed after column load");
        }
        Ok(columns)
    }

    fn stage(&self, mutate: impl FnOnce(&mut ChartState)) -> Staged {
        let mut state = self.lock();
        let before = state.effective_request();
        mutate(&mut state);
        let after = state.effective_request();
        if before == after {
            return Staged::Unchanged;
        }

        match after {
            Some(request) => {
                let ticket = state.sequencer.issue();
                state.in_flight = Some(ticket);
                Staged::Issue(ticket, request)
            }
            None => {
                // Nothing to draw; anything still in flight must not repopulate the chart.
                state.sequencer.invalidate();
                state.in_flight = None;
                state.data = None;
                state.last_error = None;
                Staged::Unconfigured
            }
        }
    }

    async fn dispatch(&self, staged: Staged) -> Result<QueryOutcome, QueryError> {
        match staged {
            Staged::Unchanged => Ok(QueryOutcome::Unchanged),
            Staged::Unconfigured => {
                let _ = self.events.send(ChartEvent::Unconfigured);
                Ok(QueryOutcome::Unconfigured)
            }
            Staged::Issue(ticket, request) => {
                debug!(
                    ticket = ticket.value(),
                    x_axis = %request.x_axis,
                    "issuing aggregate query"
                );
                let result = self.service.query_aggregate(&request).await;
                self.resolve(ticket, result)
            }
        }
    }

    fn spawn_query(self: &Arc<Self>, ticket: Ticket, request: AggregateRequest) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                ticket = ticket.value(),
                "no async runtime for aggregate query; call refresh to retry"
            );
            let mut state = self.lock();
            if state.in_flight == Some(ticket) {
                state.in_flight = None;
            }
            return false;
        };

        debug!(
            ticket = ticket.value(),
            x_axis = %request.x_axis,
            "issuing aggregate query for new filters"
        );
        let service = Arc::clone(&self.service);
        let controller = Arc::downgrade(self);
        runtime.spawn(async move {
            let result = service.query_aggregate(&request).await;
            // A torn-down controller gets no late update.
            if let Some(controller) = controller.upgrade() {
                let _ = controller.resolve(ticket, result);
            }
        });
        true
    }

    fn resolve(
        &self,
        ticket: Ticket,
        result: Result<AggregateResponse, QueryError>,
    ) -> Result<QueryOutcome, QueryError> {
        let event = {
            let mut state = self.lock();
            if !state.sequencer.is_current(ticket) {
                debug!(ticket = ticket.value(), "discarding stale aggregate response");
                return Ok(QueryOutcome::Stale);
            }
            state.in_flight = None;
            match result {
                Ok(response) => {
                    state.data = Some(response.clone());
                    state.last_error = None;
                    state.resolved_at = Some(Utc::now());
                    ChartEvent::ChartUpdated(response)
                }
                Err(err) => {
                    warn!(error = %err, "aggregate query failed; keeping previous chart");
                    state.last_error = Some(err.clone());
                    ChartEvent::QueryFailed(err)
                }
            }
        };

        let outcome = match &event {
            ChartEvent::QueryFailed(err) => Err(err.clone()),
            _ => Ok(QueryOutcome::Applied),
        };
        let _ = self.events.send(event);
        outcome
    }
}

#[cfg(test)]
#[path = "tests/chart_tests.rs"]
mod tests;
