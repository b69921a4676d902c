use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SEARCH_PATH: &str = "/search";

/// Search endpoint URL on `server`
pub fn search_url(server: &MockServer) -> String {
    format!("{}{}", server.uri(), SEARCH_PATH)
}

/// Search API envelope for one page
pub fn page_body(total_pages: u32, results: Vec<Value>) -> Value {
    json!({
        "total_pages": total_pages,
        "page": results,
    })
}

fn page_mock(page: u32) -> wiremock::MockBuilder {
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(body_partial_json(json!({ "page": page })))
}

/// Serve `body` for every request for `page`, expecting exactly `expected` hits
pub async fn mount_page(server: &MockServer, page: u32, body: Value, expected: u64) {
    page_mock(page)
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(expected)
        .mount(server)
        .await;
}

/// Same as [`mount_page`] but only for requests carrying `query`
pub async fn mount_query_page(server: &MockServer, query: &str, page: u32, body: Value) {
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(body_partial_json(json!({ "query": query, "page": page })))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Answer the first `times` requests for `page` with HTTP 429
pub async fn mount_rate_limited(server: &MockServer, page: u32, times: u64) {
    page_mock(page)
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(times)
        .expect(times)
        .mount(server)
        .await;
}

/// Respond to `page` only after `delay`, long enough to trip a client timeout
pub async fn mount_slow_page(server: &MockServer, page: u32, delay: Duration) {
    page_mock(page)
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page_body(1, vec![]))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

/// Number of requests the server has seen so far
pub async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map(|r| r.len())
        .unwrap_or(0)
}
