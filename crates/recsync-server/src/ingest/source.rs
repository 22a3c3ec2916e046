//! Source API client
//!
//! Reads one page of records per call with `GET {api_url}?page={page}&size={size}`.
//! There is no retry here; the caller decides what a failed page means.

use async_trait::async_trait;
use recsync_common::{Batch, PageRequest, Record};
use reqwest::{Client, Url};
use std::time::Duration;

use crate::error::SourceError;

/// Anything that can produce one page of records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, page: PageRequest) -> Result<Batch, SourceError>;
}

/// HTTP implementation of [`RecordSource`]
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    base: Url,
}

impl HttpSource {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let base = Url::parse(api_url).map_err(|e| SourceError::InvalidUrl(format!("{api_url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SourceError::Transport)?;
        Ok(Self { client, base })
    }

    pub fn page_url(&self, page: PageRequest) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("page", &page.page.to_string())
            .append_pair("size", &page.size.to_string());
        url
    }
}

#[async_trait]
impl RecordSource for HttpSource {
    async fn fetch(&self, page: PageRequest) -> Result<Batch, SourceError> {
        let url = self.page_url(page);
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status,
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        let records: Vec<Record> =
            serde_json::from_slice(&body).map_err(|e| SourceError::Decode(e.to_string()))?;

        tracing::debug!(%page, records = records.len(), "Page fetched");
        Ok(Batch::from(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer) -> HttpSource {
        HttpSource::new(&format!("{}/data", server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_page_url_appends_query() {
        let source = HttpSource::new("http://localhost:8088/data", Duration::from_secs(1)).unwrap();
        let url = source.page_url(PageRequest::new(3, 10000));
        assert_eq!(url.as_str(), "http://localhost:8088/data?page=3&size=10000");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let err = HttpSource::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SourceError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_fetch_decodes_records_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .and(query_param("page", "1"))
            .and(query_param("size", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 7, "name": "Ann", "email": "ann@example.com", "phone": "555-0101"},
                {"id": 3, "name": "Bob", "email": "bob@example.com", "phone": "555-0102"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let batch = source(&server).fetch(PageRequest::new(1, 2)).await.unwrap();

        let ids: Vec<i64> = batch.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![7, 3]);
        assert_eq!(batch.records()[0].email, "ann@example.com");
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = source(&server).fetch(PageRequest::new(0, 2)).await.unwrap_err();
        assert!(matches!(err, SourceError::Status { status, .. } if status.as_u16() == 500));
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"not\": \"an array\"}"))
            .mount(&server)
            .await;

        let err = source(&server).fetch(PageRequest::new(0, 2)).await.unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[tokio::test]
    async fn test_unreachable_source_is_a_transport_error() {
        let source = HttpSource::new("http://127.0.0.1:1/data", Duration::from_secs(1)).unwrap();
        let err = source.fetch(PageRequest::new(0, 2)).await.unwrap_err();
        assert!(matches!(err, SourceError::Transport(_)));
    }
}
