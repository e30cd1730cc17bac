// =============================================================================
// LunarCrush Fetcher — social aggregate posts with interaction counts
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::sources::{check_status, http_client, transport_error, FetchError, PollFetcher, RawItem};
use crate::types::{now_ms, Platform};

const FEED_URL: &str = "https://lunarcrush.com/api4/public/category/cryptocurrencies/news/v1";

pub struct LunarCrushFetcher {
    api_key: String,
    client: reqwest::Client,
}

impl LunarCrushFetcher {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: http_client(),
        }
    }
}

#[async_trait]
impl PollFetcher for LunarCrushFetcher {
    fn platform(&self) -> Platform {
        Platform::LunarCrush
    }

    fn name(&self) -> String {
        "lunarcrush".to_string()
    }

    async fn poll(&self) -> Result<Vec<RawItem>, FetchError> {
        let resp = self
            .client
            .get(FEED_URL)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(&resp)?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(format!("lunarcrush json: {e}")))?;

        let posts = body["data"].as_array().cloned().unwrap_or_default();
        debug!(count = posts.len(), "lunarcrush posts fetched");

        let mut items = Vec::with_capacity(posts.len());
        for post in posts {
            let Some(id) = post["id"]
                .as_str()
                .map(str::to_string)
                .or_else(|| post["id"].as_i64().map(|n| n.to_string()))
            else {
                continue;
            };

            let timestamp = post["post_created"]
                .as_i64()
                .map(|secs| secs * 1000)
                .unwrap_or_else(now_ms);

            items.push(RawItem {
                id,
                source: post["post_type"].as_str().unwrap_or("news").to_string(),
                timestamp,
                text: post["post_title"].as_str().unwrap_or_default().to_string(),
                author: post["creator_display_name"].as_str().map(str::to_string),
                engagement: post["interactions_total"].as_f64().unwrap_or(0.0),
                symbols_hint: Vec::new(),
            });
        }

        Ok(items)
    }
}
