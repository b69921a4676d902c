//! In-memory [`JsonFetch`] used by unit tests.

use crate::fetcher::{FailureReason, FetchFailure, FetchRequest, JsonFetch};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Scripted = Result<Value, FetchFailure>;

/// Replies per page number, in order; a page with no script left fails with HTTP 404.
#[derive(Default)]
pub struct ScriptedFetcher {
    by_page: Mutex<HashMap<u32, VecDeque<Scripted>>>,
    by_url: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requested: Mutex<Vec<u32>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, page: u32, body: Value) -> Self {
        self.push_page(page, Ok(body));
        self
    }

    pub fn fail(self, page: u32, reason: FailureReason, attempts: u32) -> Self {
        self.push_page(page, Err(FetchFailure { reason, attempts }));
        self
    }

    pub fn url(self, url: &str, body: Value) -> Self {
        self.by_url
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(Ok(body));
        self
    }

    fn push_page(&self, page: u32, reply: Scripted) {
        self.by_page
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .push_back(reply);
    }

    /// Page numbers requested so far, in request order
    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }

    /// Full URLs of requests without a page number
    pub fn requested_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl JsonFetch for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchFailure> {
        let page = request
            .payload
            .as_ref()
            .and_then(|p| p.get("page"))
            .and_then(Value::as_u64)
            .map(|p| p as u32);

        let reply = match page {
            Some(page) => {
                self.requested.lock().unwrap().push(page);
                self.by_page
                    .lock()
                    .unwrap()
                    .get_mut(&page)
                    .and_then(VecDeque::pop_front)
            }
            None => {
                let key = match &request.payload {
                    Some(Value::Object(map)) => {
                        let params: Vec<String> = map
                            .iter()
                            .map(|(k, v)| format!("{}={}", k, v.as_str().unwrap_or_default()))
                            .collect();
                        format!("{}?{}", request.url, params.join("&"))
                    }
                    _ => request.url.clone(),
                };
                self.urls.lock().unwrap().push(key.clone());
                self.by_url
                    .lock()
                    .unwrap()
                    .get_mut(&key)
                    .and_then(VecDeque::pop_front)
            }
        };

        reply.unwrap_or_else(|| {
            Err(FetchFailure {
                reason: FailureReason::HttpStatus {
                    status: 404,
                    body: "unscripted".to_string(),
                },
                attempts: 1,
            })
        })
    }
}
