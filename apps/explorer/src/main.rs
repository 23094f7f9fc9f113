mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    ChartConfig, ChartController, HttpQueryService, PageChange, QueryService, SyncBus,
    TableController,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use shared::domain::{Aggregation, ChartType, DatasetId};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; missing is fine.
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    dataset_id: Option<i64>,
    #[arg(long)]
    page_size: Option<u32>,
    /// `column=value`; repeatable.
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    sort: Option<String>,
    #[arg(long, requires = "sort")]
    descending: bool,
    #[arg(long)]
    page: Option<u32>,
    #[arg(long, value_parser = parse_wire::<ChartType>, default_value = "bar")]
    chart_type: ChartType,
    #[arg(long)]
    x_axis: Option<String>,
    #[arg(long)]
    y_axis: Option<String>,
    #[arg(long, value_parser = parse_wire::<Aggregation>, default_value = "count")]
    aggregation: Aggregation,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((column, value)) if !column.is_empty() => Ok((column.to_string(), value.to_string())),
        _ => Err(format!("expected column=value, got '{raw}'")),
    }
}

/// Accepts the lowercase wire name of a chart type or aggregation.
fn parse_wire<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| format!("unknown value '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config)?;
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }
    if let Some(dataset_id) = args.dataset_id {
        settings.dataset_id = Some(dataset_id);
    }
    if let Some(page_size) = args.page_size {
        settings.page_size = page_size;
    }
    let Some(dataset_id) = settings.dataset_id.map(DatasetId) else {
        bail!("no dataset selected; pass --dataset-id or set dataset_id in the config");
    };

    let service: Arc<dyn QueryService> = Arc::new(
        HttpQueryService::new(&settings.server_url, settings.service_options())
            .with_context(|| format!("cannot use server url '{}'", settings.server_url))?,
    );
    info!(server_url = %settings.server_url, %dataset_id, "exploring dataset");

    let bus = SyncBus::new();
    let table = TableController::with_page_size(
        Arc::clone(&service),
        Arc::clone(&bus),
        dataset_id,
        settings.page_size,
    );
    let chart = ChartController::with_config(
        Arc::clone(&service),
        dataset_id,
        ChartConfig {
            chart_type: args.chart_type,
            x_axis: args.x_axis.clone(),
            y_axis: args.y_axis.clone(),
            aggregation: args.aggregation,
        },
    );
    chart.attach(&bus);

    let (table_columns, chart_columns) = tokio::join!(
        table.load_columns(dataset_id),
        chart.load_columns(dataset_id)
    );
    table_columns.context("failed to load table columns")?;
    chart_columns.context("failed to load chart columns")?;

    for (column, value) in &args.filters {
        table
            .set_filter(column, Some(value))
            .await
            .with_context(|| format!("filter {column}={value} failed"))?;
    }
    if let Some(term) = &args.search {
        table.set_search_term(term).await.context("search failed")?;
    }
    if let Some(column) = &args.sort {
        table.set_sort(column).await.context("sort failed")?;
        if args.descending {
            table.set_sort(column).await.context("sort failed")?;
        }
    }
    table.refresh().await.context("row query failed")?;
    if let Some(page) = args.page {
        table
            .set_page(PageChange::Absolute(page))
            .await
            .context("page change failed")?;
    }

    // Supersedes any aggregate query the filter publications spawned.
    chart.refresh().await.context("aggregate query failed")?;

    let rows = table.snapshot();
    let aggregate = chart.snapshot();
    let (first, last) = rows.pagination.window();
    let output = json!({
        "table": {
            "dataset_id": rows.dataset_id,
            "columns": rows.columns,
            "filters": rows.filters,
            "search": rows.search,
            "page": rows.pagination.page,
            "total_pages": rows.pagination.total_pages,
            "total": rows.pagination.total,
            "showing": [first, last],
            "rows": rows.rows,
        },
        "chart": {
            "configured": aggregate.is_configured(),
            "x_axis": aggregate.config.x_axis,
            "y_axis": aggregate.config.y_axis,
            "aggregation": aggregate.config.aggregation,
            "data": aggregate.data,
        },
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
