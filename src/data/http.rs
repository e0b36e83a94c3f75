//! HTTP adapter for a financial data REST API
//!
//! Endpoints follow the financialdatasets.ai layout:
//! `/prices/`, `/financial-metrics/`, `/news/`, `/insider-trades/`.

use super::{CompanyNews, DataError, FinancialMetrics, InsiderTrade, MarketDataSource, Price};
use crate::models::DateRange;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpMarketData {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMarketData {
    pub fn new(base_url: &str, api_key: Option<String>) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, DataError> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }

        let response = request.send().await.map_err(|e| {
            DataError::UpstreamUnavailable(format!("request to {} failed: {}", path, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataError::UpstreamUnavailable(format!(
                "{} returned {}",
                path, status
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DataError::Malformed(format!("{}: {}", path, e)))
    }
}

#[derive(Deserialize)]
struct PriceResponse {
    #[serde(default)]
    prices: Vec<Price>,
}

#[derive(Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    financial_metrics: Vec<FinancialMetrics>,
}

#[derive(Deserialize)]
struct NewsResponse {
    #[serde(default)]
    news: Vec<CompanyNews>,
}

#[derive(Deserialize)]
struct InsiderTradeResponse {
    #[serde(default)]
    insider_trades: Vec<InsiderTrade>,
}

fn day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[async_trait]
impl MarketDataSource for HttpMarketData {
    async fn prices(&self, ticker: &str, range: &DateRange) -> Result<Vec<Price>, DataError> {
        let body: PriceResponse = self
            .get_json(
                "/prices/",
                &[
                    ("ticker", ticker.to_string()),
                    ("interval", "day".to_string()),
                    ("interval_multiplier", "1".to_string()),
                    ("start_date", day(range.start)),
                    ("end_date", day(range.end)),
                ],
            )
            .await?;
        Ok(body.prices)
    }

    async fn financial_metrics(
        &self,
        ticker: &str,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<FinancialMetrics>, DataError> {
        let body: MetricsResponse = self
            .get_json(
                "/financial-metrics/",
                &[
                    ("ticker", ticker.to_string()),
                    ("report_period_lte", day(end)),
                    ("limit", limit.to_string()),
                    ("period", "ttm".to_string()),
                ],
            )
            .await?;
        Ok(body.financial_metrics)
    }

    async fn company_news(
        &self,
        ticker: &str,
        range: &DateRange,
        limit: usize,
    ) -> Result<Vec<CompanyNews>, DataError> {
        let body: NewsResponse = self
            .get_json(
                "/news/",
                &[
                    ("ticker", ticker.to_string()),
                    ("start_date", day(range.start)),
                    ("end_date", day(range.end)),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(body.news)
    }

    async fn insider_trades(
        &self,
        ticker: &str,
        range: &DateRange,
        limit: usize,
    ) -> Result<Vec<InsiderTrade>, DataError> {
        let body: InsiderTradeResponse = self
            .get_json(
                "/insider-trades/",
                &[
                    ("ticker", ticker.to_string()),
                    ("filing_date_gte", day(range.start)),
                    ("filing_date_lte", day(range.end)),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(body.insider_trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_envelopes_tolerate_missing_lists() {
        let prices: PriceResponse = serde_json::from_str("{}").unwrap();
        assert!(prices.prices.is_empty());

        let news: NewsResponse = serde_json::from_str(
            r#"{"news": [{"ticker": "AAPL", "title": "Record quarter", "date": "2024-03-01"}]}"#,
        )
        .unwrap();
        assert_eq!(news.news[0].title, "Record quarter");
        assert!(news.news[0].sentiment.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_upstream_unavailable() {
        let source = HttpMarketData::new("http://127.0.0.1:9", None).unwrap();
        let range = DateRange::ending(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(), 7);

        let err = source.prices("AAPL", &range).await.unwrap_err();
        assert!(matches!(err, DataError::UpstreamUnavailable(_)));
    }
}
