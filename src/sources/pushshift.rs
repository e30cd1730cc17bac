// =============================================================================
// Pushshift Fetcher — Reddit submissions, best effort
// =============================================================================
//
// The public pushshift endpoint has a history of going dark. This source is
// therefore optional by policy: initialization never fails because of it,
// and outages only put this one adapter into backoff/failed.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::sources::{check_status, http_client, transport_error, FetchError, PollFetcher, RawItem};
use crate::types::{now_ms, Platform};

const SEARCH_URL: &str = "https://api.pushshift.io/reddit/search/submission";

pub struct PushshiftFetcher {
    subreddits: Vec<String>,
    max_results: usize,
    client: reqwest::Client,
}

impl PushshiftFetcher {
    pub fn new(subreddits: Vec<String>, max_results: usize) -> Self {
        Self {
            subreddits,
            max_results,
            client: http_client(),
        }
    }
}

#[async_trait]
impl PollFetcher for PushshiftFetcher {
    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    fn name(&self) -> String {
        format!("pushshift({})", self.subreddits.join(","))
    }

    async fn poll(&self) -> Result<Vec<RawItem>, FetchError> {
        let subreddits = self.subreddits.join(",");
        let size = self.max_results.to_string();
        let resp = self
            .client
            .get(SEARCH_URL)
            .query(&[
                ("subreddit", subreddits.as_str()),
                ("size", size.as_str()),
                ("sort", "desc"),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        check_status(&resp)?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(format!("pushshift json: {e}")))?;

        let posts = body["data"].as_array().cloned().unwrap_or_default();
        debug!(count = posts.len(), "pushshift submissions fetched");

        let mut items = Vec::with_capacity(posts.len());
        for post in posts {
            let Some(id) = post["id"].as_str().map(str::to_string) else {
                continue;
            };

            let title = post["title"].as_str().unwrap_or_default();
            let selftext = post["selftext"].as_str().unwrap_or_default();
            let text = if selftext.is_empty() {
                title.to_string()
            } else {
                format!("{title} {selftext}")
            };

            let score = post["score"].as_f64().unwrap_or(0.0);
            let comments = post["num_comments"].as_f64().unwrap_or(0.0);

            items.push(RawItem {
                id,
                source: post["subreddit"].as_str().unwrap_or("reddit").to_string(),
                timestamp: post["created_utc"]
                    .as_i64()
                    .map(|secs| secs * 1000)
                    .unwrap_or_else(now_ms),
                text,
                author: post["author"].as_str().map(str::to_string),
                engagement: score + comments,
                symbols_hint: Vec::new(),
            });
        }

        Ok(items)
    }
}
