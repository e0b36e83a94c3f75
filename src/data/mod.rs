//! Market data collaborator
//!
//! Raw sources implement [`MarketDataSource`] and may fail. Analysis tasks
//! only see [`MarketData`], which turns every failure into an empty result so
//! a data outage degrades an opinion instead of the run.

use crate::models::DateRange;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub mod http;
pub use http::HttpMarketData;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Upstream data unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Malformed upstream payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Price {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FinancialMetrics {
    pub ticker: String,
    pub report_period: String,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub price_to_earnings_ratio: Option<f64>,
    #[serde(default)]
    pub price_to_book_ratio: Option<f64>,
    #[serde(default)]
    pub gross_margin: Option<f64>,
    #[serde(default)]
    pub operating_margin: Option<f64>,
    #[serde(default)]
    pub net_margin: Option<f64>,
    #[serde(default)]
    pub return_on_equity: Option<f64>,
    #[serde(default)]
    pub debt_to_equity: Option<f64>,
    #[serde(default)]
    pub current_ratio: Option<f64>,
    #[serde(default)]
    pub revenue_growth: Option<f64>,
    #[serde(default)]
    pub earnings_growth: Option<f64>,
    #[serde(default)]
    pub earnings_per_share: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanyNews {
    pub ticker: String,
    pub title: String,
    pub date: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsiderTrade {
    pub ticker: String,
    pub filing_date: String,
    #[serde(default)]
    pub transaction_shares: Option<f64>,
    #[serde(default)]
    pub transaction_value: Option<f64>,
}

/// Raw retrieval adapter keyed by symbol and date range.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn prices(&self, ticker: &str, range: &DateRange) -> Result<Vec<Price>, DataError>;

    async fn financial_metrics(
        &self,
        ticker: &str,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<FinancialMetrics>, DataError>;

    async fn company_news(
        &self,
        ticker: &str,
        range: &DateRange,
        limit: usize,
    ) -> Result<Vec<CompanyNews>, DataError>;

    async fn insider_trades(
        &self,
        ticker: &str,
        range: &DateRange,
        limit: usize,
    ) -> Result<Vec<InsiderTrade>, DataError>;
}

/// Failure-absorbing view over a [`MarketDataSource`].
#[derive(Clone)]
pub struct MarketData {
    source: Arc<dyn MarketDataSource>,
}

impl MarketData {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self { source }
    }

    /// View with no data at all.
    pub fn empty() -> Self {
        Self::new(Arc::new(InMemoryMarketData::new()))
    }

    pub async fn prices(&self, ticker: &str, range: &DateRange) -> Vec<Price> {
        absorb(ticker, "prices", self.source.prices(ticker, range).await)
    }

    pub async fn financial_metrics(&self, ticker: &str, end: NaiveDate, limit: usize) -> Vec<FinancialMetrics> {
        absorb(
            ticker,
            "financial_metrics",
            self.source.financial_metrics(ticker, end, limit).await,
        )
    }

    pub async fn company_news(&self, ticker: &str, range: &DateRange, limit: usize) -> Vec<CompanyNews> {
        absorb(
            ticker,
            "company_news",
            self.source.company_news(ticker, range, limit).await,
        )
    }

    pub async fn insider_trades(&self, ticker: &str, range: &DateRange, limit: usize) -> Vec<InsiderTrade> {
        absorb(
            ticker,
            "insider_trades",
            self.source.insider_trades(ticker, range, limit).await,
        )
    }

    /// Latest close in the range, if any prices exist.
    pub async fn latest_close(&self, ticker: &str, range: &DateRange) -> Option<f64> {
        self.prices(ticker, range).await.last().map(|p| p.close)
    }
}

fn absorb<T>(ticker: &str, dataset: &str, result: Result<Vec<T>, DataError>) -> Vec<T> {
    result.unwrap_or_else(|e| {
        warn!(ticker, dataset, error = %e, "Market data unavailable, continuing with empty set");
        Vec::new()
    })
}

/// Fixture-backed source for development & testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryMarketData {
    prices: HashMap<String, Vec<Price>>,
    metrics: HashMap<String, Vec<FinancialMetrics>>,
    news: HashMap<String, Vec<CompanyNews>>,
    insider_trades: HashMap<String, Vec<InsiderTrade>>,
    unavailable: bool,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source whose every call fails with `UpstreamUnavailable`.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn with_prices(mut self, ticker: &str, prices: Vec<Price>) -> Self {
        self.prices.insert(ticker.to_string(), prices);
        self
    }

    pub fn with_metrics(mut self, ticker: &str, metrics: Vec<FinancialMetrics>) -> Self {
        self.metrics.insert(ticker.to_string(), metrics);
        self
    }

    pub fn with_news(mut self, ticker: &str, news: Vec<CompanyNews>) -> Self {
        self.news.insert(ticker.to_string(), news);
        self
    }

    pub fn with_insider_trades(mut self, ticker: &str, trades: Vec<InsiderTrade>) -> Self {
        self.insider_trades.insert(ticker.to_string(), trades);
        self
    }

    fn lookup<T: Clone>(&self, map: &HashMap<String, Vec<T>>, ticker: &str, limit: usize) -> Result<Vec<T>, DataError> {
        if self.unavailable {
            return Err(DataError::UpstreamUnavailable(format!("no source for {}", ticker)));
        }
        Ok(map
            .get(ticker)
            .map(|items| items.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MarketDataSource for InMemoryMarketData {
    async fn prices(&self, ticker: &str, _range: &DateRange) -> Result<Vec<Price>, DataError> {
        self.lookup(&self.prices, ticker, usize::MAX)
    }

    async fn financial_metrics(
        &self,
        ticker: &str,
        _end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<FinancialMetrics>, DataError> {
        self.lookup(&self.metrics, ticker, limit)
    }

    async fn company_news(
        &self,
        ticker: &str,
        _range: &DateRange,
        limit: usize,
    ) -> Result<Vec<CompanyNews>, DataError> {
        self.lookup(&self.news, ticker, limit)
    }

    async fn insider_trades(
        &self,
        ticker: &str,
        _range: &DateRange,
        limit: usize,
    ) -> Result<Vec<InsiderTrade>, DataError> {
        self.lookup(&self.insider_trades, ticker, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> DateRange {
        DateRange::ending(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(), 30)
    }

    fn price(close: f64) -> Price {
        Price {
            time: "2024-03-28T00:00:00".to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000,
        }
    }

    #[tokio::test]
    async fn test_upstream_failure_becomes_empty() {
        let data = MarketData::new(Arc::new(InMemoryMarketData::unavailable()));

        assert!(data.prices("AAPL", &range()).await.is_empty());
        assert!(data.company_news("AAPL", &range(), 10).await.is_empty());
        assert!(data.latest_close("AAPL", &range()).await.is_none());
    }

    #[tokio::test]
    async fn test_fixture_lookup_respects_limit() {
        let source = InMemoryMarketData::new()
            .with_prices("AAPL", vec![price(170.0), price(172.5)])
            .with_metrics(
                "AAPL",
                vec![FinancialMetrics::default(), FinancialMetrics::default()],
            );
        let data = MarketData::new(Arc::new(source));

        assert_eq!(data.latest_close("AAPL", &range()).await, Some(172.5));
        assert_eq!(data.financial_metrics("AAPL", range().end, 1).await.len(), 1);
        assert!(data.prices("MSFT", &range()).await.is_empty());
    }
}
