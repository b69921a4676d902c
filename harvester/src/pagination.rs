//! Page-by-page walking of a paginated search query
//!
//! A [`PaginationWalker`] is lazy: each call to [`PaginationWalker::next_page`]
//! performs at most one request. It learns the page total from the first
//! page, stops for good at the first unrecoverable failure, and cannot be
//! rewound. Seed it from a [`Checkpoint`] to request only missing pages.

use crate::checkpoint::Checkpoint;
use crate::config::{ApiConfig, HttpMethod};
use crate::decode::{results_of, total_pages_of};
use crate::fetcher::{FetchFailure, FetchRequest, JsonFetch};
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Builds the request for one page of a query
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub page_size: u32,
}

impl RequestTemplate {
    /// Template for the configured API, with the resolved auth header if any
    pub fn from_config(api: &ApiConfig, api_key: Option<&str>) -> Self {
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if let Some(key) = api_key {
            headers.push((api.auth.header.clone(), api.auth.header_value(key)));
        }

        Self {
            method: api.method,
            url: api.endpoint.clone(),
            headers,
            page_size: api.page_size,
        }
    }

    /// `{"query", "page", "page_size"}` as a JSON body (POST) or query string (GET)
    pub fn page_request(&self, query: &str, page: u32) -> FetchRequest {
        FetchRequest {
            method: self.method,
            url: self.url.clone(),
            payload: Some(json!({
                "query": query,
                "page": page,
                "page_size": self.page_size,
            })),
            headers: self.headers.clone(),
        }
    }
}

/// One successfully fetched page
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub page: u32,
    /// Page total known after this page
    pub total_pages: u32,
    pub results: Vec<Value>,
}

/// How a walk ended
#[derive(Debug, Clone, PartialEq)]
pub enum WalkOutcome {
    Complete {
        total_pages: u32,
    },
    /// Retries were exhausted or the request failed for good
    Partial {
        highest_page: Option<u32>,
        total_pages: Option<u32>,
        failure: FetchFailure,
    },
}

impl WalkOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, WalkOutcome::Complete { .. })
    }
}

pub struct PaginationWalker<'a, F: JsonFetch> {
    fetcher: &'a F,
    template: &'a RequestTemplate,
    query: String,
    inter_page_delay: Duration,
    queue: VecDeque<u32>,
    done: BTreeSet<u32>,
    total_pages: Option<u32>,
    highest_page: Option<u32>,
    records_fetched: usize,
    requests_made: u32,
    failure: Option<FetchFailure>,
}

impl<'a, F: JsonFetch> PaginationWalker<'a, F> {
    /// Fresh walk starting at page 1
    pub fn new(
        fetcher: &'a F,
        template: &'a RequestTemplate,
        query: &str,
        inter_page_delay: Duration,
    ) -> Self {
        Self {
            fetcher,
            template,
            query: query.to_string(),
            inter_page_delay,
            queue: VecDeque::from([1]),
            done: BTreeSet::new(),
            total_pages: None,
            highest_page: None,
            records_fetched: 0,
            requests_made: 0,
            failure: None,
        }
    }

    /// Walk only the pages a checkpoint is missing
    pub fn resume_from(
        fetcher: &'a F,
        template: &'a RequestTemplate,
        checkpoint: &Checkpoint,
        inter_page_delay: Duration,
    ) -> Self {
        let mut walker = Self::new(fetcher, template, &checkpoint.query, inter_page_delay);
        walker.queue = checkpoint.missing_pages().into();
        walker.done = checkpoint.pages_done.clone();
        walker.total_pages = checkpoint.total_pages;
        walker.highest_page = checkpoint.pages_done.iter().next_back().copied();
        walker
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn total_pages(&self) -> Option<u32> {
        self.total_pages
    }

    pub fn highest_page(&self) -> Option<u32> {
        self.highest_page
    }

    /// Records returned by pages fetched during this walk
    pub fn records_fetched(&self) -> usize {
        self.records_fetched
    }

    /// Pages this walk still intends to request
    pub fn pending_pages(&self) -> Vec<u32> {
        self.queue.iter().copied().collect()
    }

    /// Fetch the next missing page; `None` once finished or failed
    pub async fn next_page(&mut self) -> Option<PageResult> {
        if self.failure.is_some() {
            return None;
        }

        let page = self.queue.pop_front()?;

        if self.requests_made > 0 && !self.inter_page_delay.is_zero() {
            sleep(self.inter_page_delay).await;
        }
        self.requests_made += 1;

        let request = self.template.page_request(&self.query, page);
        match self.fetcher.fetch(&request).await {
            Ok(body) => {
                if self.total_pages.is_none() {
                    self.learn_total(total_pages_of(&body));
                }

                let results = results_of(&body).to_vec();
                self.done.insert(page);
                self.highest_page = Some(self.highest_page.map_or(page, |h| h.max(page)));
                self.records_fetched += results.len();

                let total = self.total_pages.unwrap_or(page);
                debug!(
                    "{:?} page {}/{}: {} records",
                    self.query,
                    page,
                    total,
                    results.len()
                );

                Some(PageResult {
                    page,
                    total_pages: total,
                    results,
                })
            }
            Err(failure) => {
                warn!(
                    "{:?} page {} failed after {} attempt(s): {}",
                    self.query, page, failure.attempts, failure.reason
                );
                self.queue.clear();
                self.failure = Some(failure);
                None
            }
        }
    }

    fn learn_total(&mut self, reported: u32) {
        let total = self.total_pages.map_or(reported, |known| known.max(reported));
        self.total_pages = Some(total);

        // Only page 1 is ever queued before the total is known
        let done = &self.done;
        self.queue.extend((2..=total).filter(|p| !done.contains(p)));
    }

    /// Consume the walker and report how it ended
    pub fn outcome(self) -> WalkOutcome {
        match self.failure {
            Some(failure) => WalkOutcome::Partial {
                highest_page: self.highest_page,
                total_pages: self.total_pages,
                failure,
            },
            None => WalkOutcome::Complete {
                total_pages: self.total_pages.unwrap_or(self.done.len() as u32),
            },
        }
    }
}

/// Drain a walker, returning every fetched page and the outcome
pub async fn walk_all<F: JsonFetch>(
    mut walker: PaginationWalker<'_, F>,
) -> (Vec<PageResult>, WalkOutcome) {
    let mut pages = Vec::new();
    while let Some(page) = walker.next_page().await {
        pages.push(page);
    }
    (pages, walker.outcome())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FailureReason;
    use crate::test_support::ScriptedFetcher;

    fn template() -> RequestTemplate {
        RequestTemplate {
            method: HttpMethod::Post,
            url: "http://localhost/search".to_string(),
            headers: Vec::new(),
            page_size: 2,
        }
    }

    #[test]
    fn test_page_request_payload() {
        let request = template().page_request("ip = 1.2.3.4", 3);
        assert_eq!(
            request.payload,
            Some(json!({"query": "ip = 1.2.3.4", "page": 3, "page_size": 2}))
        );
    }

    #[tokio::test]
    async fn test_walks_all_pages_in_order() {
        let fetcher = ScriptedFetcher::new()
            .page(1, json!({"total_pages": 3, "page": [1, 2]}))
            .page(2, json!({"page": [3, 4]}))
            .page(3, json!({"page": [5]}));
        let template = template();

        let walker = PaginationWalker::new(&fetcher, &template, "q", Duration::ZERO);
        let (pages, outcome) = walk_all(walker).await;

        assert_eq!(pages.iter().map(|p| p.page).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(outcome, WalkOutcome::Complete { total_pages: 3 });
        assert_eq!(fetcher.requested_pages(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_total_means_single_page() {
        let fetcher = ScriptedFetcher::new().page(1, json!({"results": [1]}));
        let template = template();

        let (pages, outcome) =
            walk_all(PaginationWalker::new(&fetcher, &template, "q", Duration::ZERO)).await;
        assert_eq!(pages.len(), 1);
        assert!(outcome.is_complete());
    }

    #[tokio::test]
    async fn test_large_total_queues_every_remaining_page() {
        let fetcher = ScriptedFetcher::new().page(1, json!({"total_pages": 200_000, "page": []}));
        let template = template();

        let mut walker = PaginationWalker::new(&fetcher, &template, "q", Duration::ZERO);
        let first = walker.next_page().await.unwrap();
        assert_eq!(first.total_pages, 200_000);

        let pending = walker.pending_pages();
        assert_eq!(pending.len(), 199_999);
        assert_eq!(pending.first(), Some(&2));
        assert_eq!(pending.last(), Some(&200_000));
    }

    #[tokio::test]
    async fn test_failure_stops_walk() {
        let fetcher = ScriptedFetcher::new()
            .page(1, json!({"total_pages": 3, "page": [1]}))
            .fail(2, FailureReason::RateLimited, 4);
        let template = template();

        let mut walker = PaginationWalker::new(&fetcher, &template, "q", Duration::ZERO);
        assert!(walker.next_page().await.is_some());
        assert!(walker.next_page().await.is_none());
        assert!(walker.next_page().await.is_none());
        assert_eq!(walker.records_fetched(), 1);

        match walker.outcome() {
            WalkOutcome::Partial { highest_page, total_pages, failure } => {
                assert_eq!(highest_page, Some(1));
                assert_eq!(total_pages, Some(3));
                assert_eq!(failure.attempts, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fetcher.requested_pages(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_resume_requests_only_missing_pages() {
        let mut checkpoint = Checkpoint::new("k", "q");
        checkpoint.record_page(1, vec![json!(1)], Some(4));
        checkpoint.record_page(3, vec![json!(3)], None);

        let fetcher = ScriptedFetcher::new()
            .page(2, json!({"page": [2]}))
            .page(4, json!({"page": [4]}));
        let template = template();

        let walker = PaginationWalker::resume_from(&fetcher, &template, &checkpoint, Duration::ZERO);
        assert_eq!(walker.pending_pages(), vec![2, 4]);

        let (pages, outcome) = walk_all(walker).await;
        assert_eq!(pages.len(), 2);
        assert_eq!(outcome, WalkOutcome::Complete { total_pages: 4 });
        assert_eq!(fetcher.requested_pages(), vec![2, 4]);
    }

    #[tokio::test]
    async fn test_resume_of_complete_checkpoint_makes_no_requests() {
        let mut checkpoint = Checkpoint::new("k", "q");
        checkpoint.record_page(1, vec![], Some(1));

        let fetcher = ScriptedFetcher::new();
        let template = template();
        let (pages, outcome) = walk_all(PaginationWalker::resume_from(
            &fetcher,
            &template,
            &checkpoint,
            Duration::ZERO,
        ))
        .await;

        assert!(pages.is_empty());
        assert_eq!(outcome, WalkOutcome::Complete { total_pages: 1 });
        assert!(fetcher.requested_pages().is_empty());
    }
}
