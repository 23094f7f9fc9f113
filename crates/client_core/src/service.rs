use async_trait::async_trait;
use shared::{
    domain::DatasetId,
    protocol::{AggregateRequest, AggregateResponse, ColumnsResponse, QueryRequest, QueryResponse},
};

use crate::error::QueryError;

/// Remote source answering row, aggregate and column-list queries.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn get_columns(&self, dataset_id: DatasetId) -> Result<ColumnsResponse, QueryError>;
    async fn query_rows(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError>;
    async fn query_aggregate(
        &self,
        request: &AggregateRequest,
    ) -> Result<AggregateResponse, QueryError>;
}
