use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Aggregation, ChartType, DatasetId, SortDirection};

/// One table row: column name to scalar (string, number, bool or null).
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnsResponse {
    #[serde(default)]
    pub columns: Vec<String>,
}

/// Row query: `POST /data/filter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub dataset_id: DatasetId,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub search_term: Option<String>,
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: Vec<Record>,
    pub total: u64,
    pub total_pages: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

impl QueryResponse {
    pub fn new(data: Vec<Record>, total: u64, total_pages: u32) -> Self {
        Self {
            data,
            total,
            total_pages,
            page: None,
            page_size: None,
        }
    }
}

/// Aggregate query: `POST /charts/data`. Carries filters only, never search, sort or paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub dataset_id: DatasetId,
    pub chart_type: ChartType,
    pub x_axis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_axis: Option<String>,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Palette {
    Single(String),
    PerPoint(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub data: Vec<f64>,
    #[serde(
        rename = "backgroundColor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub background_color: Option<Palette>,
    #[serde(rename = "borderColor", default, skip_serializing_if = "Option::is_none")]
    pub border_color: Option<Palette>,
    #[serde(rename = "borderWidth", default, skip_serializing_if = "Option::is_none")]
    pub border_width: Option<u32>,
}

/// Chart-type-tagged series payload, shaped for a bar/line/pie renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub labels: Vec<String>,
    pub datasets: Vec<ChartSeries>,
    pub chart_type: ChartType,
}

impl AggregateResponse {
    pub fn empty(chart_type: ChartType) -> Self {
        Self {
            labels: Vec::new(),
            datasets: Vec::new(),
            chart_type,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Pairs each label with the first series' value at the same index.
    pub fn primary_points(&self) -> Vec<(&str, f64)> {
        let Some(series) = self.datasets.first() else {
            return Vec::new();
        };
        self.labels
            .iter()
            .zip(series.data.iter())
            .map(|(label, value)| (label.as_str(), *value))
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
