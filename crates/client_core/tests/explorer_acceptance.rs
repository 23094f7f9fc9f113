use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use client_core::{
    ChartConfig, ChartController, ChartEvent, HttpQueryService, HttpServiceOptions, QueryOutcome,
    QueryService, SyncBus, TableController,
};
use serde_json::{json, Value};
use shared::{
    domain::{Aggregation, Axis, ChartType, DatasetId, SortDirection},
    protocol::{
        AggregateRequest, AggregateResponse, ChartSeries, QueryRequest, QueryResponse, Record,
    },
};
use tokio::{net::TcpListener, sync::Mutex};

const DATASET: DatasetId = DatasetId(1);

#[derive(Clone)]
struct Dataset {
    rows: Arc<Vec<Record>>,
    aggregate_requests: Arc<Mutex<Vec<AggregateRequest>>>,
}

fn city_sales_rows() -> Vec<Record> {
    [
        ("NYC", 10.0),
        ("LA", 4.0),
        ("NYC", 5.5),
        ("Boston", 7.0),
        ("LA", 1.0),
    ]
    .into_iter()
    .map(|(city, sales)| {
        json!({ "city": city, "sales": sales })
            .as_object()
            .cloned()
            .expect("object")
    })
    .collect()
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn matching<'a>(rows: &'a [Record], filters: &BTreeMap<String, String>) -> Vec<&'a Record> {
    rows.iter()
        .filter(|row| {
            filters
                .iter()
                .all(|(column, value)| text(row.get(column)) == *value)
        })
        .collect()
}

async fn columns(Path(_dataset_id): Path<i64>) -> Json<Value> {
    Json(json!({ "columns": ["city", "sales"] }))
}

async fn filter_rows(
    State(dataset): State<Dataset>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    // A single-letter search is slow, so its response overtakes the longer ones.
    if request.search_term.as_deref().is_some_and(|term| term.len() == 1) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let mut rows = matching(&dataset.rows, &request.filters);
    if let Some(term) = request.search_term.as_deref().map(str::to_lowercase) {
        rows.retain(|row| {
            row.values()
                .any(|value| text(Some(value)).to_lowercase().contains(&term))
        });
    }
    if let Some(key) = &request.sort_by {
        rows.sort_by_key(|row| text(row.get(key)).to_lowercase());
        if request.sort_order == SortDirection::Descending {
            rows.reverse();
        }
    }

    let total = rows.len() as u64;
    let page_size = request.page_size.max(1) as usize;
    let total_pages = rows.len().div_ceil(page_size) as u32;
    let start = (request.page.saturating_sub(1) as usize) * page_size;
    let data = rows
        .into_iter()
        .skip(start)
        .take(page_size)
        .cloned()
        .collect();
    Json(QueryResponse::new(data, total, total_pages))
}

async fn chart_data(
    State(dataset): State<Dataset>,
    Json(request): Json<AggregateRequest>,
) -> Json<AggregateResponse> {
    dataset.aggregate_requests.lock().await.push(request.clone());

    let mut groups: Vec<(String, f64)> = Vec::new();
    for row in matching(&dataset.rows, &request.filters) {
        let label = text(row.get(&request.x_axis));
        let value = match (&request.y_axis, request.aggregation) {
            (Some(y_axis), Aggregation::Sum) => {
                row.get(y_axis).and_then(Value::as_f64).unwrap_or(0.0)
            }
            _ => 1.0,
        };
        match groups.iter_mut().find(|(existing, _)| *existing == label) {
            Some((_, total)) => *total += value,
            None => groups.push((label, value)),
        }
    }

    Json(AggregateResponse {
        labels: groups.iter().map(|(label, _)| label.clone()).collect(),
        datasets: vec![ChartSeries {
            label: request.y_axis.clone(),
            data: groups.iter().map(|(_, value)| *value).collect(),
            background_color: None,
            border_color: None,
            border_width: None,
        }],
        chart_type: request.chart_type,
    })
}

async fn spawn_dataset_server() -> anyhow::Result<(String, Dataset)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let dataset = Dataset {
        rows: Arc::new(city_sales_rows()),
        aggregate_requests: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/data/columns/:dataset_id", get(columns))
        .route("/data/filter", post(filter_rows))
        .route("/charts/data", post(chart_data))
        .with_state(dataset.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), dataset))
}

async fn wait_for_chart(
    events: &mut tokio::sync::broadcast::Receiver<ChartEvent>,
) -> AggregateResponse {
    let next = async {
        loop {
            match events.recv().await.expect("chart event") {
                ChartEvent::ChartUpdated(response) => return response,
                ChartEvent::QueryFailed(err) => panic!("chart query failed: {err}"),
                _ => continue,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), next)
        .await
        .expect("chart update in time")
}

#[tokio::test]
async fn city_filter_reaches_table_and_chart() {
    let (url, dataset) = spawn_dataset_server().await.expect("spawn server");
    let service: Arc<dyn QueryService> =
        Arc::new(HttpQueryService::new(&url, HttpServiceOptions::default()).expect("service"));
    let bus = SyncBus::new();
    let table = TableController::new(Arc::clone(&service), Arc::clone(&bus), DATASET);
    let chart = ChartController::with_config(
        Arc::clone(&service),
        DATASET,
        ChartConfig {
            chart_type: ChartType::Bar,
            x_axis: Some("city".into()),
            y_axis: Some("sales".into()),
            aggregation: Aggregation::Sum,
        },
    );
    chart.attach(&bus);
    let mut chart_events = chart.subscribe_events();

    let columns = table.load_columns(DATASET).await.expect("columns");
    assert_eq!(columns, ["city", "sales"]);

    let outcome = table
        .set_filter("city", Some("NYC"))
        .await
        .expect("filter");
    assert_eq!(outcome, QueryOutcome::Applied);

    let table_view = table.snapshot();
    assert_eq!(table_view.pagination.page, 1);
    assert_eq!(table_view.pagination.total, 2);
    assert!(table_view.rows.iter().all(|row| row["city"] == "NYC"));

    let chart_view = wait_for_chart(&mut chart_events).await;
    assert_eq!(chart_view.primary_points(), vec![("NYC", 15.5)]);

    let requests = dataset.aggregate_requests.lock().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].x_axis, "city");
    assert_eq!(requests[0].y_axis.as_deref(), Some("sales"));
    assert_eq!(requests[0].aggregation, Aggregation::Sum);
    assert_eq!(requests[0].filters.get("city").map(String::as_str), Some("NYC"));
}

#[tokio::test]
async fn slow_early_search_response_is_discarded() {
    let (url, _dataset) = spawn_dataset_server().await.expect("spawn server");
    let service: Arc<dyn QueryService> =
        Arc::new(HttpQueryService::new(&url, HttpServiceOptions::default()).expect("service"));
    let table = TableController::new(service, SyncBus::new(), DATASET);

    let (n, ny, nyc) = futures::future::join3(
        table.set_search_term("n"),
        table.set_search_term("ny"),
        table.set_search_term("nyc"),
    )
    .await;

    assert_eq!(n.expect("n"), QueryOutcome::Stale);
    assert_eq!(ny.expect("ny"), QueryOutcome::Stale);
    assert_eq!(nyc.expect("nyc"), QueryOutcome::Applied);

    let view = table.snapshot();
    assert_eq!(view.search, "nyc");
    assert_eq!(view.pagination.total, 2);
    assert!(view.rows.iter().all(|row| row["city"] == "NYC"));
}

#[tokio::test]
async fn pie_chart_counts_filtered_categories() {
    let (url, dataset) = spawn_dataset_server().await.expect("spawn server");
    let service: Arc<dyn QueryService> =
        Arc::new(HttpQueryService::new(&url, HttpServiceOptions::default()).expect("service"));
    let bus = SyncBus::new();
    let table = TableController::new(Arc::clone(&service), Arc::clone(&bus), DATASET);
    let chart = ChartController::new(Arc::clone(&service), DATASET);
    chart.attach(&bus);

    chart.load_columns(DATASET).await.expect("axis columns");
    chart
        .set_axis(Axis::Y, Some("sales"))
        .await
        .expect("y axis");
    chart.set_chart_type(ChartType::Pie).await.expect("pie");

    let mut chart_events = chart.subscribe_events();
    table.set_filter("city", Some("LA")).await.expect("filter");
    let view = wait_for_chart(&mut chart_events).await;
    assert_eq!(view.chart_type, ChartType::Pie);
    assert_eq!(view.primary_points(), vec![("LA", 2.0)]);

    let last = dataset
        .aggregate_requests
        .lock()
        .await
        .last()
        .cloned()
        .expect("request");
    assert_eq!(last.y_axis, None);
    assert_eq!(last.aggregation, Aggregation::Count);
}
