use crate::config::UpstreamConfig;
use crate::error::FetchError;
use crate::granularity::Granularity;
use crate::upstream::{LatestQuote, LatestSnapshot, PriceSource, WindowQuote, WindowSnapshot};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct Envelope<T> {
    #[serde(default)]
    data: HashMap<String, T>,
    #[serde(default)]
    timestamp: Option<i64>,
}

pub struct HttpPriceSource {
    client: Client,
    base_url: String,
}

impl HttpPriceSource {
    pub fn new(config: &UpstreamConfig) -> Result<Self, FetchError> {
        // The source blocks clients without a descriptive agent
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<String, FetchError> {
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    #[instrument(skip(self))]
    async fn fetch_latest(&self) -> Result<LatestSnapshot, FetchError> {
        let body = self.get(&format!("{}/latest", self.base_url), &[]).await?;
        let snapshot = decode_latest(&body)?;
        debug!("Fetched latest prices for {} items", snapshot.quotes.len());
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn fetch_window(
        &self,
        granularity: Granularity,
        timestamp: i64,
    ) -> Result<WindowSnapshot, FetchError> {
        let url = format!("{}/{}", self.base_url, granularity.label());
        let body = self.get(&url, &[("timestamp", timestamp.to_string())]).await?;
        let snapshot = decode_window(&body)?;
        debug!(
            "Fetched {} window {:?} with {} items",
            granularity,
            snapshot.timestamp,
            snapshot.quotes.len()
        );
        Ok(snapshot)
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<(Option<i64>, HashMap<i64, T>), FetchError> {
    let envelope: Envelope<T> = serde_json::from_str(body)?;
    let mut quotes = HashMap::with_capacity(envelope.data.len());
    for (key, quote) in envelope.data {
        match key.parse::<i64>() {
            Ok(item_id) => {
                quotes.insert(item_id, quote);
            }
            Err(_) => warn!("Skipping upstream entry with non-numeric id '{}'", key),
        }
    }
    Ok((envelope.timestamp, quotes))
}

pub fn decode_latest(body: &str) -> Result<LatestSnapshot, FetchError> {
    let (_, quotes) = decode::<LatestQuote>(body)?;
    Ok(LatestSnapshot { quotes })
}

pub fn decode_window(body: &str) -> Result<WindowSnapshot, FetchError> {
    let (timestamp, quotes) = decode::<WindowQuote>(body)?;
    Ok(WindowSnapshot { timestamp, quotes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_latest_payload() {
        let body = r#"{"data":{
            "2":{"high":160,"highTime":1700000000,"low":155,"lowTime":1699999990},
            "6":{"high":190000,"highTime":1700000010,"low":null,"lowTime":null}
        }}"#;
        let snapshot = decode_latest(body).unwrap();
        assert_eq!(snapshot.quotes.len(), 2);
        assert_eq!(
            snapshot.quotes[&2],
            LatestQuote {
                high: Some(160),
                high_time: Some(1_700_000_000),
                low: Some(155),
                low_time: Some(1_699_999_990),
            }
        );
        assert_eq!(snapshot.quotes[&6].low, None);
    }

    #[test]
    fn decodes_window_payload_and_served_timestamp() {
        let body = r#"{"data":{
            "2":{"avgHighPrice":161,"highPriceVolume":1200,"avgLowPrice":null,"lowPriceVolume":0}
        },"timestamp":1700000100}"#;
        let snapshot = decode_window(body).unwrap();
        assert_eq!(snapshot.timestamp, Some(1_700_000_100));
        let candle = snapshot.quotes[&2].to_candle(2, 1_700_000_100);
        assert_eq!(candle.avg_high_price, Some(161));
        assert_eq!(candle.avg_low_price, None);
        assert_eq!(candle.low_price_volume, Some(0));
    }

    #[test]
    fn skips_non_numeric_ids() {
        let body = r#"{"data":{"abc":{"high":1},"4":{"high":2}},"timestamp":null}"#;
        let snapshot = decode_latest(body).unwrap();
        assert_eq!(snapshot.quotes.keys().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn missing_data_decodes_to_an_empty_snapshot() {
        let snapshot = decode_window(r#"{"timestamp":1700000100}"#).unwrap();
        assert!(snapshot.quotes.is_empty());
        assert_eq!(snapshot.timestamp, Some(1_700_000_100));
        assert!(decode_latest("{}").unwrap().quotes.is_empty());
    }

    #[test]
    fn malformed_body_is_a_fetch_error() {
        assert!(matches!(decode_window("<html>"), Err(FetchError::Decode(_))));
    }
}
