// =============================================================================
// Twitter Filtered Stream — long-lived chunked HTTP connection
// =============================================================================
//
// The v2 filtered stream is newline-delimited JSON over one chunked HTTP
// response. Connect syncs the configured rules first, then opens the stream;
// the generic streaming loop in `sources` owns reconnect/backoff/idle
// handling.
// =============================================================================

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::sources::{
    check_status, transport_error, FetchError, LineStream, RawItem, StreamRule, StreamTransport,
};
use crate::types::{now_ms, Platform};

const STREAM_URL: &str = "https://api.twitter.com/2/tweets/search/stream";
const RULES_URL: &str = "https://api.twitter.com/2/tweets/search/stream/rules";

pub struct TwitterTransport {
    bearer_token: String,
    rules: Vec<StreamRule>,
    client: reqwest::Client,
}

impl TwitterTransport {
    pub fn new(bearer_token: String, rules: Vec<StreamRule>) -> Self {
        // No overall timeout here: the stream response body is long-lived by
        // design. Idle detection happens in the read loop.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self {
            bearer_token,
            rules,
            client,
        }
    }

    /// Push the configured rule set. Existing duplicate rules are fine; the
    /// API reports them as errors per rule without failing the request.
    async fn sync_rules(&self) -> Result<(), FetchError> {
        if self.rules.is_empty() {
            return Ok(());
        }
        let add: Vec<serde_json::Value> = self
            .rules
            .iter()
            .map(|r| serde_json::json!({ "value": r.value, "tag": r.tag }))
            .collect();

        let resp = self
            .client
            .post(RULES_URL)
            .bearer_auth(&self.bearer_token)
            .json(&serde_json::json!({ "add": add }))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(&resp)?;
        info!(rules = self.rules.len(), "twitter stream rules synced");
        Ok(())
    }
}

#[async_trait]
impl StreamTransport for TwitterTransport {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn name(&self) -> String {
        "twitter-stream".to_string()
    }

    async fn connect(&self) -> Result<LineStream, FetchError> {
        self.sync_rules().await?;

        let resp = self
            .client
            .get(STREAM_URL)
            .bearer_auth(&self.bearer_token)
            .query(&[
                ("tweet.fields", "created_at,public_metrics,author_id"),
                ("expansions", "author_id"),
                ("user.fields", "username"),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        check_status(&resp)?;

        Ok(lines_from_bytes(resp.bytes_stream()))
    }

    fn parse_line(&self, line: &str) -> Result<Option<RawItem>, FetchError> {
        parse_tweet_line(line)
    }
}

/// Split a chunked byte stream into complete newline-terminated lines. Bytes
/// after the last newline stay buffered until the next chunk.
fn lines_from_bytes(
    stream: impl futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> LineStream {
    let source = stream.map(|chunk| chunk.map_err(transport_error));
    Box::pin(futures_util::stream::unfold(
        (Box::pin(source), String::new(), Vec::<String>::new()),
        |(mut source, mut buffer, mut pending)| async move {
            loop {
                if !pending.is_empty() {
                    let line = pending.remove(0);
                    return Some((Ok(line), (source, buffer, pending)));
                }
                match source.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim_end_matches('\r').to_string();
                            buffer.drain(..=pos);
                            pending.push(line);
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), (source, buffer, pending))),
                    None => return None,
                }
            }
        },
    ))
}

/// Parse one filtered-stream payload into a raw item. Empty keep-alive lines
/// and non-data payloads yield `None`.
fn parse_tweet_line(line: &str) -> Result<Option<RawItem>, FetchError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let root: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| FetchError::Parse(format!("tweet json: {e}")))?;

    let data = &root["data"];
    let Some(id) = data["id"].as_str() else {
        // Rule-match metadata or error frames carry no tweet payload.
        debug!("non-data stream frame skipped");
        return Ok(None);
    };

    let metrics = &data["public_metrics"];
    let engagement: f64 = ["retweet_count", "reply_count", "like_count", "quote_count"]
        .into_iter()
        .map(|k| metrics[k].as_f64().unwrap_or(0.0))
        .sum();

    let author = root["includes"]["users"]
        .as_array()
        .and_then(|users| {
            let author_id = data["author_id"].as_str()?;
            users
                .iter()
                .find(|u| u["id"].as_str() == Some(author_id))
                .and_then(|u| u["username"].as_str())
        })
        .map(str::to_string)
        .or_else(|| data["author_id"].as_str().map(str::to_string));

    Ok(Some(RawItem {
        id: id.to_string(),
        source: "filtered-stream".to_string(),
        timestamp: data["created_at"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(now_ms),
        text: data["text"].as_str().unwrap_or_default().to_string(),
        author,
        engagement,
        symbols_hint: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_lines_are_skipped() {
        assert!(parse_tweet_line("").unwrap().is_none());
        assert!(parse_tweet_line("\r\n").unwrap().is_none());
    }

    #[test]
    fn data_frames_become_raw_items() {
        let line = r#"{
            "data": {
                "id": "1234",
                "text": "$BTC breaking out",
                "author_id": "99",
                "created_at": "2024-03-01T12:30:00.000Z",
                "public_metrics": {"retweet_count": 3, "reply_count": 1, "like_count": 10, "quote_count": 0}
            },
            "includes": {"users": [{"id": "99", "username": "cryptotrader"}]}
        }"#;
        let item = parse_tweet_line(line).unwrap().unwrap();
        assert_eq!(item.id, "1234");
        assert_eq!(item.author.as_deref(), Some("cryptotrader"));
        assert_eq!(item.engagement, 14.0);
        assert_eq!(item.timestamp, 1_709_296_200_000);
    }

    #[test]
    fn non_data_frames_are_skipped() {
        let line = r#"{"errors": [{"title": "operational-disconnect"}]}"#;
        assert!(parse_tweet_line(line).unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            parse_tweet_line("{not json"),
            Err(FetchError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn byte_chunks_reassemble_into_lines() {
        use futures_util::StreamExt;

        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"a\":1}\r\n{\"b\"")),
            Ok(bytes::Bytes::from_static(b":2}\n")),
        ];
        let mut lines = lines_from_bytes(futures_util::stream::iter(chunks));

        assert_eq!(lines.next().await.unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(lines.next().await.unwrap().unwrap(), "{\"b\":2}");
        assert!(lines.next().await.is_none());
    }
}
