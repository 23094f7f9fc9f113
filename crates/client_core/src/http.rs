use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::DatasetId,
    error::ErrorDetail,
    protocol::{AggregateRequest, AggregateResponse, ColumnsResponse, QueryRequest, QueryResponse},
};
use tracing::debug;
use url::Url;

use crate::{error::QueryError, service::QueryService};

const ROWS_ENDPOINT: &str = "data/filter";
const COLUMNS_ENDPOINT: &str = "data/columns";
const CHART_ENDPOINT: &str = "charts/data";

#[derive(Debug, Clone, Default)]
pub struct HttpServiceOptions {
    pub auth_token: Option<String>,
    pub request_timeout: Option<Duration>,
}

/// [`QueryService`] over the dashboard's JSON HTTP API.
pub struct HttpQueryService {
    http: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpQueryService {
    pub fn new(base_url: &str, options: HttpServiceOptions) -> Result<Self, QueryError> {
        let mut base_url = Url::parse(base_url.trim())
            .map_err(|err| QueryError::InvalidUrl(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(QueryError::InvalidUrl(base_url.to_string()));
        }
        // Url::join drops the last path segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut builder = Client::builder();
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            base_url,
            auth_token: options.auth_token.filter(|token| !token.is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, QueryError> {
        self.base_url
            .join(path)
            .map_err(|err| QueryError::InvalidUrl(format!("{path}: {err}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn decode_response<T: DeserializeOwned>(
    endpoint: &'static str,
    response: Response,
) -> Result<T, QueryError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorDetail>(&body).unwrap_or_else(|_| {
            if body.trim().is_empty() {
                ErrorDetail::new(status.canonical_reason().unwrap_or("request failed"))
            } else {
                ErrorDetail::new(body)
            }
        });
        return Err(QueryError::Rejected {
            endpoint,
            status: status.as_u16(),
            detail,
        });
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| QueryError::Decode {
        endpoint,
        message: err.to_string(),
    })
}

#[async_trait]
impl QueryService for HttpQueryService {
    async fn get_columns(&self, dataset_id: DatasetId) -> Result<ColumnsResponse, QueryError> {
        let url = self.endpoint(&format!("{COLUMNS_ENDPOINT}/{dataset_id}"))?;
        debug!(%url, "fetching column list");
        let response = self.authorize(self.http.get(url)).send().await?;
        decode_response(COLUMNS_ENDPOINT, response).await
    }

    async fn query_rows(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let url = self.endpoint(ROWS_ENDPOINT)?;
        let response = self
            .authorize(self.http.post(url).json(request))
            .send()
            .await?;
        decode_response(ROWS_ENDPOINT, response).await
    }

    async fn query_aggregate(
        &self,
        request: &AggregateRequest,
    ) -> Result<AggregateResponse, QueryError> {
        let url = self.endpoint(CHART_ENDPOINT)?;
        let response = self
            .authorize(self.http.post(url).json(request))
            .send()
            .await?;
        decode_response(CHART_ENDPOINT, response).await
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
