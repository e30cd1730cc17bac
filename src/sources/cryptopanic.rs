// =============================================================================
// CryptoPanic Fetcher — curated crypto news with vote counts and coin tags
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::sources::{check_status, http_client, transport_error, FetchError, PollFetcher, RawItem};
use crate::types::{now_ms, Platform};

const POSTS_URL: &str = "https://cryptopanic.com/api/v1/posts/";

pub struct CryptoPanicFetcher {
    api_key: String,
    client: reqwest::Client,
}

impl CryptoPanicFetcher {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: http_client(),
        }
    }
}

#[async_trait]
impl PollFetcher for CryptoPanicFetcher {
    fn platform(&self) -> Platform {
        Platform::CryptoPanic
    }

    fn name(&self) -> String {
        "cryptopanic".to_string()
    }

    async fn poll(&self) -> Result<Vec<RawItem>, FetchError> {
        let resp = self
            .client
            .get(POSTS_URL)
            .query(&[("auth_token", self.api_key.as_str()), ("public", "true")])
            .send()
            .await
            .map_err(transport_error)?;
        check_status(&resp)?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(format!("cryptopanic json: {e}")))?;

        let results = body["results"].as_array().cloned().unwrap_or_default();
        debug!(count = results.len(), "cryptopanic posts fetched");

        let mut items = Vec::with_capacity(results.len());
        for post in results {
            let Some(id) = post["id"]
                .as_i64()
                .map(|n| n.to_string())
                .or_else(|| post["slug"].as_str().map(str::to_string))
            else {
                continue;
            };

            // Vote counts collapse into one engagement number.
            let votes = &post["votes"];
            let engagement: f64 = ["positive", "negative", "important", "liked", "comments"]
                .into_iter()
                .map(|k| votes[k].as_f64().unwrap_or(0.0))
                .sum();

            // CryptoPanic tags posts with currencies; pass them through so
            // the extractor does not have to rediscover them from the title.
            let symbols_hint = post["currencies"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|c| c["code"].as_str().map(str::to_uppercase))
                        .collect()
                })
                .unwrap_or_default();

            items.push(RawItem {
                id,
                source: post["source"]["title"]
                    .as_str()
                    .unwrap_or("cryptopanic")
                    .to_string(),
                timestamp: post["published_at"]
                    .as_str()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or_else(now_ms),
                text: post["title"].as_str().unwrap_or_default().to_string(),
                author: None,
                engagement,
                symbols_hint,
            });
        }

        Ok(items)
    }
}
