//! Tally form-response client: paged API fetch plus local fixture loading
//! for dry runs.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use revsync_core::Response;

pub const CRATE_NAME: &str = "revsync-tally";

pub const TALLY_API_BASE: &str = "https://api.tally.so";
const PAGE_LIMIT: u32 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid Tally credentials (http {status})")]
    Auth { status: u16 },
    #[error("Tally form {form_id} not found")]
    NotFound { form_id: String },
    #[error("http status {status} for {url}")]
    Http { status: u16, url: String },
    #[error("failed to reach Tally: {0}")]
    Network(#[from] reqwest::Error),
    #[error("decoding Tally response payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Map a non-success status onto the fetch taxonomy. 401/403 are credential
/// failures, 404 means the form id does not exist.
pub fn classify_status(status: StatusCode, form_id: &str, url: &str) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Auth {
            status: status.as_u16(),
        },
        StatusCode::NOT_FOUND => FetchError::NotFound {
            form_id: form_id.to_string(),
        },
        _ => FetchError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesPage {
    #[serde(default)]
    data: Vec<Response>,
    #[serde(default, rename = "totalPages")]
    total_pages: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TallyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl TallyClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: TALLY_API_BASE.to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch every response for a form, oldest first, walking the paged API
    /// until an empty page or past `totalPages`.
    pub async fn fetch_all_responses(&self, form_id: &str) -> Result<Vec<Response>, FetchError> {
        let mut responses = Vec::new();
        let mut page = 1u32;
        loop {
            let url = format!("{}/forms/{}/responses", self.base_url, form_id);
            let reply = self
                .http
                .get(&url)
                .query(&[
                    ("page", page.to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                    ("sort", "asc".to_string()),
                ])
                .bearer_auth(&self.api_key)
                .send()
                .await?;

            let status = reply.status();
            let final_url = reply.url().to_string();
            if !status.is_success() {
                return Err(classify_status(status, form_id, &final_url));
            }

            let body = reply.bytes().await?;
            let payload: ResponsesPage =
                serde_json::from_slice(&body).map_err(FetchError::Decode)?;
            if payload.data.is_empty() {
                break;
            }
            responses.extend(payload.data);

            // A missing totalPages means keep walking; the empty-page check
            // above terminates the loop.
            if let Some(total_pages) = payload.total_pages {
                if page >= total_pages {
                    break;
                }
            }
            page += 1;
        }

        debug!(form_id, count = responses.len(), "fetched Tally responses");
        Ok(responses)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixturePayload {
    Wrapped { data: Vec<Response> },
    Bare(Vec<Response>),
}

/// Load pre-fetched responses from a local JSON file, accepting either the
/// raw API envelope (`{"data": [...]}`) or a bare array.
pub fn load_fixture(path: impl AsRef<Path>) -> Result<Vec<Response>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading responses file {}", path.display()))?;
    let payload: FixturePayload = serde_json::from_str(&text)
        .with_context(|| format!("parsing responses file {}", path.display()))?;
    Ok(match payload {
        FixturePayload::Wrapped { data } => data,
        FixturePayload::Bare(responses) => responses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn status_classification_covers_the_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "frm", "u"),
            FetchError::Auth { status: 401 }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "frm", "u"),
            FetchError::Auth { status: 403 }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "frm", "u"),
            FetchError::NotFound { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "frm", "u"),
            FetchError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn fixture_loader_accepts_wrapped_and_bare_payloads() {
        let dir = tempdir().expect("tempdir");
        let record = json!({
            "id": "resp-1",
            "submittedAt": "2026-03-01T09:30:00Z",
            "answers": [
                {"question": {"label": "Product"}, "value": "Kettle"}
            ]
        });

        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(
            &wrapped,
            serde_json::to_vec(&json!({"data": [record], "page": 1, "totalPages": 1})).unwrap(),
        )
        .unwrap();
        let responses = load_fixture(&wrapped).expect("wrapped fixture");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, "resp-1");

        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, serde_json::to_vec(&json!([record])).unwrap()).unwrap();
        let responses = load_fixture(&bare).expect("bare fixture");
        assert_eq!(responses.len(), 1);
    }

    #[test]
    fn fixture_loader_rejects_other_shapes() {
        let dir = tempdir().expect("tempdir");
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, br#"{"responses": []}"#).unwrap();
        assert!(load_fixture(&bad).is_err());
    }

    #[test]
    fn responses_page_tolerates_missing_fields() {
        let page: ResponsesPage = serde_json::from_value(json!({})).expect("empty page");
        assert!(page.data.is_empty());
        assert!(page.total_pages.is_none());
    }

    /// Serve pre-canned JSON bodies in request order on a local listener,
    /// one connection per request.
    fn spawn_api_stub(replies: Vec<(u16, serde_json::Value)>) -> String {
        use std::io::{BufRead, BufReader, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        std::thread::spawn(move || {
            for (status, body) in replies {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                }
                let body = body.to_string();
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    fn page_body(ids: &[&str], total_pages: Option<u32>) -> serde_json::Value {
        let data: Vec<_> = ids
            .iter()
            .map(|id| json!({"id": id, "submittedAt": "2026-03-01T09:30:00Z", "answers": []}))
            .collect();
        match total_pages {
            Some(total) => json!({"data": data, "totalPages": total}),
            None => json!({"data": data}),
        }
    }

    #[tokio::test]
    async fn pagination_without_total_pages_runs_until_an_empty_page() {
        let base_url = spawn_api_stub(vec![
            (200, page_body(&["p1"], None)),
            (200, page_body(&["p2"], None)),
            (200, page_body(&[], None)),
        ]);
        let client = TallyClient::new("key").expect("client").with_base_url(base_url);
        let responses = client.fetch_all_responses("frm").await.expect("fetch");
        let ids: Vec<_> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn pagination_stops_past_total_pages() {
        // Only two replies exist; a third request would hit a closed listener.
        let base_url = spawn_api_stub(vec![
            (200, page_body(&["p1"], Some(2))),
            (200, page_body(&["p2"], Some(2))),
        ]);
        let client = TallyClient::new("key").expect("client").with_base_url(base_url);
        let responses = client.fetch_all_responses("frm").await.expect("fetch");
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn auth_failure_surfaces_from_the_api() {
        let base_url = spawn_api_stub(vec![(401, json!({"message": "nope"}))]);
        let client = TallyClient::new("bad-key").expect("client").with_base_url(base_url);
        let err = client.fetch_all_responses("frm").await.expect_err("must fail");
        assert!(matches!(err, FetchError::Auth { status: 401 }));
    }
}
