//! Scripted [`QueryService`] shared by the controller tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::DatasetId,
    error::ErrorDetail,
    protocol::{
        AggregateRequest, AggregateResponse, ChartSeries, ColumnsResponse, QueryRequest,
        QueryResponse, Record,
    },
};
use tokio::sync::oneshot;

use crate::{error::QueryError, service::QueryService};

type RowReply = Result<QueryResponse, QueryError>;
type AggregateReply = Result<AggregateResponse, QueryError>;

pub(crate) struct FakeQueryService {
    gated: bool,
    columns: Mutex<Vec<String>>,
    totals: Mutex<(u64, u32)>,
    fail_rows: AtomicBool,
    fail_aggregates: AtomicBool,
    column_fetches: AtomicUsize,
    row_requests: Mutex<Vec<QueryRequest>>,
    aggregate_requests: Mutex<Vec<AggregateRequest>>,
    pending_rows: Mutex<VecDeque<(QueryRequest, oneshot::Sender<RowReply>)>>,
    pending_aggregates: Mutex<VecDeque<(AggregateRequest, oneshot::Sender<AggregateReply>)>>,
}

impl FakeQueryService {
    /// Answers every call immediately.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    /// Parks every row and aggregate call until the test releases it.
    pub(crate) fn gated() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(gated: bool) -> Self {
        Self {
            gated,
            columns: Mutex::new(vec!["city".into(), "sales".into()]),
            totals: Mutex::new((120, 3)),
            fail_rows: AtomicBool::new(false),
            fail_aggregates: AtomicBool::new(false),
            column_fetches: AtomicUsize::new(0),
            row_requests: Mutex::new(Vec::new()),
            aggregate_requests: Mutex::new(Vec::new()),
            pending_rows: Mutex::new(VecDeque::new()),
            pending_aggregates: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn set_columns(&self, columns: &[&str]) {
        *self.columns.lock().expect("lock") = columns.iter().map(|c| c.to_string()).collect();
    }

    pub(crate) fn set_totals(&self, total: u64, total_pages: u32) {
        *self.totals.lock().expect("lock") = (total, total_pages);
    }

    pub(crate) fn fail_rows(&self, fail: bool) {
        self.fail_rows.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_aggregates(&self, fail: bool) {
        self.fail_aggregates.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn column_fetches(&self) -> usize {
        self.column_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn row_requests(&self) -> Vec<QueryRequest> {
        self.row_requests.lock().expect("lock").clone()
    }

    pub(crate) fn aggregate_requests(&self) -> Vec<AggregateRequest> {
        self.aggregate_requests.lock().expect("lock").clone()
    }

    pub(crate) fn pending_rows(&self) -> usize {
        self.pending_rows.lock().expect("lock").len()
    }

    pub(crate) fn pending_aggregates(&self) -> usize {
        self.pending_aggregates.lock().expect("lock").len()
    }

    /// Completes the parked row call at `index` (in issue order among those still parked).
    pub(crate) fn release_row(&self, index: usize, reply: RowReply) -> QueryRequest {
        let (request, tx) = self
            .pending_rows
            .lock()
            .expect("lock")
            .remove(index)
            .expect("parked row call");
        let _ = tx.send(reply);
        request
    }

    pub(crate) fn release_aggregate(
        &self,
        index: usize,
        reply: AggregateReply,
    ) -> AggregateRequest {
        let (request, tx) = self
            .pending_aggregates
            .lock()
            .expect("lock")
            .remove(index)
            .expect("parked aggregate call");
        let _ = tx.send(reply);
        request
    }

    pub(crate) fn answer_rows(&self, request: &QueryRequest) -> RowReply {
        if self.fail_rows.load(Ordering::SeqCst) {
            return Err(server_error("/data/filter"));
        }
        let (total, total_pages) = *self.totals.lock().expect("lock");
        Ok(QueryResponse::new(vec![echo_row(request)], total, total_pages))
    }

    pub(crate) fn answer_aggregate(&self, request: &AggregateRequest) -> AggregateReply {
        if self.fail_aggregates.load(Ordering::SeqCst) {
            return Err(server_error("/charts/data"));
        }
        Ok(chart_for(request))
    }
}

/// Waits until `condition` holds, yielding to other tasks in between.
pub(crate) async fn settle(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

pub(crate) fn server_error(endpoint: &'static str) -> QueryError {
    QueryError::Rejected {
        endpoint,
        status: 503,
        detail: ErrorDetail::new("temporarily unavailable"),
    }
}

pub(crate) fn record(value: Value) -> Record {
    value.as_object().cloned().expect("object record")
}

/// One row describing the request that produced it.
pub(crate) fn echo_row(request: &QueryRequest) -> Record {
    record(json!({
        "city": request.filters.get("city").cloned().unwrap_or_default(),
        "search": request.search_term.clone().unwrap_or_default(),
        "page": request.page,
    }))
}

pub(crate) fn rows_reply(request: &QueryRequest, total: u64, total_pages: u32) -> RowReply {
    Ok(QueryResponse::new(vec![echo_row(request)], total, total_pages))
}

pub(crate) fn chart_for(request: &AggregateRequest) -> AggregateResponse {
    let labels = match request.filters.get(&request.x_axis) {
        Some(value) => vec![value.clone()],
        None => vec!["LA".to_string(), "NYC".to_string()],
    };
    let data = labels.iter().map(|_| 1.0).collect();
    AggregateResponse {
        labels,
        datasets: vec![ChartSeries {
            label: request.y_axis.clone(),
            data,
            background_color: None,
            border_color: None,
            border_width: None,
        }],
        chart_type: request.chart_type,
    }
}

#[async_trait]
impl QueryService for FakeQueryService {
    async fn get_columns(&self, _dataset_id: DatasetId) -> Result<ColumnsResponse, QueryError> {
        self.column_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(ColumnsResponse {
            columns: self.columns.lock().expect("lock").clone(),
        })
    }

    async fn query_rows(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        self.row_requests.lock().expect("lock").push(request.clone());
        if !self.gated {
            return self.answer_rows(request);
        }
        let (tx, rx) = oneshot::channel();
        self.pending_rows
            .lock()
            .expect("lock")
            .push_back((request.clone(), tx));
        rx.await
            .unwrap_or_else(|_| Err(QueryError::Transport("gate dropped".into())))
    }

    async fn query_aggregate(
        &self,
        request: &AggregateRequest,
    ) -> Result<AggregateResponse, QueryError> {
        self.aggregate_requests
            .lock()
            .expect("lock")
            .push(request.clone());
        if !self.gated {
            return self.answer_aggregate(request);
        }
        let (tx, rx) = oneshot::channel();
        self.pending_aggregates
            .lock()
            .expect("lock")
            .push_back((request.clone(), tx));
        rx.await
            .unwrap_or_else(|_| Err(QueryError::Transport("gate dropped".into())))
    }
}
