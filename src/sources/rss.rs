// =============================================================================
// RSS Fetcher — crypto news feeds via a JSON conversion endpoint
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::sources::{check_status, http_client, transport_error, FetchError, PollFetcher, RawItem};
use crate::types::{now_ms, Platform};

const CONVERT_URL: &str = "https://api.rss2json.com/v1/api.json";

/// Polls one or more RSS feeds through the rss2json conversion API so every
/// source speaks JSON.
pub struct RssFetcher {
    feeds: Vec<String>,
    client: reqwest::Client,
}

impl RssFetcher {
    pub fn new(feeds: Vec<String>) -> Self {
        Self {
            feeds,
            client: http_client(),
        }
    }
}

#[async_trait]
impl PollFetcher for RssFetcher {
    fn platform(&self) -> Platform {
        Platform::Rss
    }

    fn name(&self) -> String {
        format!("rss({} feeds)", self.feeds.len())
    }

    async fn poll(&self) -> Result<Vec<RawItem>, FetchError> {
        let mut items = Vec::new();

        for feed_url in &self.feeds {
            let resp = self
                .client
                .get(CONVERT_URL)
                .query(&[("rss_url", feed_url.as_str())])
                .send()
                .await
                .map_err(transport_error)?;
            check_status(&resp)?;

            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| FetchError::Parse(format!("rss json: {e}")))?;

            let feed_title = body["feed"]["title"].as_str().unwrap_or(feed_url).to_string();
            let entries = body["items"].as_array().cloned().unwrap_or_default();
            debug!(feed = %feed_url, count = entries.len(), "rss feed fetched");

            for entry in entries {
                let Some(id) = entry["guid"]
                    .as_str()
                    .or_else(|| entry["link"].as_str())
                    .map(str::to_string)
                else {
                    continue; // item without identity cannot be deduped
                };

                let title = entry["title"].as_str().unwrap_or_default();
                let description = entry["description"].as_str().unwrap_or_default();
                let text = if description.is_empty() {
                    title.to_string()
                } else {
                    format!("{title} {description}")
                };

                items.push(RawItem {
                    id,
                    source: feed_title.clone(),
                    timestamp: parse_pub_date(entry["pubDate"].as_str()),
                    text,
                    author: entry["author"].as_str().filter(|a| !a.is_empty()).map(str::to_string),
                    engagement: 0.0,
                    symbols_hint: Vec::new(),
                });
            }
        }

        Ok(items)
    }
}

/// rss2json normalizes dates to "YYYY-MM-DD HH:MM:SS"; raw feeds use
/// RFC 2822. Unparseable dates fall back to arrival time.
fn parse_pub_date(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else {
        return now_ms();
    };
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return dt.and_utc().timestamp_millis();
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(raw) {
        return dt.timestamp_millis();
    }
    now_ms()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_normalized_and_rfc2822_dates() {
        let ms = parse_pub_date(Some("2024-03-01 12:30:00"));
        assert_eq!(ms, 1_709_296_200_000);

        let ms = parse_pub_date(Some("Fri, 01 Mar 2024 12:30:00 +0000"));
        assert_eq!(ms, 1_709_296_200_000);
    }

    #[test]
    fn garbage_dates_fall_back_to_now() {
        let before = now_ms();
        let ms = parse_pub_date(Some("not a date"));
        assert!(ms >= before);
    }
}
