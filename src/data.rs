use crate::error::{PortfolioError, PortfolioResult};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use tracing::{info, warn};

static DATA_PROVIDER_MODE: OnceLock<DataProviderMode> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataProviderMode {
    Polygon,
    Yfinance,
}

impl DataProviderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polygon => "polygon",
            Self::Yfinance => "yfinance",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "polygon" => DataProviderMode::Polygon,
            "yfinance" | "yahoo" => DataProviderMode::Yfinance,
            other => {
                warn!(
                    "Unknown PORTFOLIO_DATA_PROVIDER={} ; defaulting to yfinance. Allowed values: polygon | yfinance",
                    other
                );
                DataProviderMode::Yfinance
            }
        }
    }
}

pub fn configured_data_provider_mode() -> DataProviderMode {
    *DATA_PROVIDER_MODE.get_or_init(|| {
        let provider = std::env::var("PORTFOLIO_DATA_PROVIDER").unwrap_or_else(|_| "yfinance".to_string());
        DataProviderMode::parse(&provider)
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Price Table
// ──────────────────────────────────────────────────────────────────────────────

/// Raw daily closes for one instrument, as delivered by a supplier.
/// `None` marks a date the supplier listed without a usable price.
#[derive(Clone, Debug)]
pub struct PriceSeries {
    pub symbol: String,
    pub observations: Vec<(NaiveDate, Option<f64>)>,
}

/// Date-aligned closing prices, one column per instrument.
///
/// Built through [`PriceTable::from_rows`] or [`PriceTable::from_series`], which
/// forward-fill gaps and drop any date where an instrument has no value yet.
/// Every stored row therefore has exactly one finite price per instrument.
#[derive(Clone, Debug)]
pub struct PriceTable {
    symbols: Vec<String>,
    dates: Vec<NaiveDate>,
    rows: Vec<Vec<f64>>,
}

impl PriceTable {
    /// Builds a cleaned table from raw rows in strictly increasing date order.
    pub fn from_rows(
        symbols: Vec<String>,
        rows: Vec<(NaiveDate, Vec<Option<f64>>)>,
    ) -> PortfolioResult<Self> {
        let n = symbols.len();
        let mut seen = HashSet::new();
        for s in &symbols {
            if !seen.insert(s.as_str()) {
                return Err(PortfolioError::InvalidInput(format!("duplicate instrument {}", s)));
            }
        }

        let mut last: Vec<Option<f64>> = vec![None; n];
        let mut prev_date: Option<NaiveDate> = None;
        let mut dates = Vec::with_capacity(rows.len());
        let mut clean = Vec::with_capacity(rows.len());

        for (date, raw) in rows {
            if raw.len() != n {
                return Err(PortfolioError::DimensionMismatch { expected: n, actual: raw.len() });
            }
            if prev_date.is_some_and(|p| date <= p) {
                return Err(PortfolioError::InvalidInput(format!(
                    "price dates must be strictly increasing ({} after {:?})",
                    date, prev_date
                )));
            }
            prev_date = Some(date);

            for (slot, value) in last.iter_mut().zip(raw) {
                if let Some(v) = value.filter(|v| v.is_finite()) {
                    *slot = Some(v);
                }
            }

            if let Some(row) = last.iter().copied().collect::<Option<Vec<f64>>>() {
                dates.push(date);
                clean.push(row);
            }
        }

        Ok(Self { symbols, dates, rows: clean })
    }

    /// Merges per-instrument series on the union of their dates, then cleans.
    pub fn from_series(series: Vec<PriceSeries>) -> PortfolioResult<Self> {
        let n = series.len();
        let symbols: Vec<String> = series.iter().map(|s| s.symbol.clone()).collect();

        let mut by_date: BTreeMap<NaiveDate, Vec<Option<f64>>> = BTreeMap::new();
        for (col, s) in series.into_iter().enumerate() {
            for (date, price) in s.observations {
                let row = by_date.entry(date).or_insert_with(|| vec![None; n]);
                if price.is_some() {
                    row[col] = price;
                }
            }
        }

        Self::from_rows(symbols, by_date.into_iter().collect())
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn num_instruments(&self) -> usize {
        self.symbols.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Per-period simple returns; one row shorter than the table.
    pub fn simple_returns(&self) -> PortfolioResult<Vec<Vec<f64>>> {
        let mut out = Vec::with_capacity(self.rows.len().saturating_sub(1));
        for (idx, w) in self.rows.windows(2).enumerate() {
            let mut row = Vec::with_capacity(self.symbols.len());
            for (col, (prev, next)) in w[0].iter().zip(w[1].iter()).enumerate() {
                if *prev <= 0.0 {
                    return Err(PortfolioError::InvalidPrice {
                        symbol: self.symbols[col].clone(),
                        row: idx,
                        price: *prev,
                    });
                }
                row.push(next / prev - 1.0);
            }
            out.push(row);
        }
        Ok(out)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Supplier Wire Formats
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<YahooError>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    #[serde(default)]
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Option<Vec<YahooAdjClose>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooAdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
struct PolygonAggsResponse {
    status: Option<String>,
    results: Option<Vec<PolygonAgg>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
struct PolygonAgg {
    #[serde(rename = "t")]
    timestamp_ms: i64,
    #[serde(rename = "c")]
    close: f64,
}

fn timestamp_to_date(seconds: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(seconds, 0).map(|dt| dt.date_naive())
}

/// Extracts a close series, preferring the split/dividend adjusted column.
fn yahoo_response_to_series(symbol: &str, response: YahooChartResponse) -> Result<PriceSeries> {
    if let Some(err) = response.chart.error {
        return Err(anyhow::anyhow!(
            "Yahoo returned error for {}: {} {}",
            symbol,
            err.code.unwrap_or_default(),
            err.description.unwrap_or_default()
        ));
    }

    let result = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or(anyhow::anyhow!("No data found for {}", symbol))?;

    let adjusted = result
        .indicators
        .adjclose
        .and_then(|a| a.into_iter().next())
        .map(|a| a.adjclose)
        .filter(|a| !a.is_empty());

    let closes = match adjusted {
        Some(adj) => adj,
        None => {
            warn!("{}: adjusted close not found, using close instead", symbol);
            result
                .indicators
                .quote
                .into_iter()
                .next()
                .map(|q| q.close)
                .ok_or(anyhow::anyhow!("No close prices found for {}", symbol))?
        }
    };

    if closes.len() != result.timestamp.len() {
        return Err(anyhow::anyhow!(
            "{}: {} timestamps but {} closes",
            symbol,
            result.timestamp.len(),
            closes.len()
        ));
    }

    let mut observations = Vec::with_capacity(closes.len());
    for (&ts, close) in result.timestamp.iter().zip(closes) {
        if let Some(date) = timestamp_to_date(ts) {
            observations.push((date, close));
        }
    }

    if observations.iter().all(|(_, c)| c.is_none()) {
        return Err(anyhow::anyhow!("No usable prices for {} in requested range", symbol));
    }

    Ok(PriceSeries {
        symbol: symbol.to_string(),
        observations,
    })
}

fn polygon_response_to_series(symbol: &str, response: PolygonAggsResponse) -> Result<PriceSeries> {
    let results = response.results.unwrap_or_default();
    if results.is_empty() {
        return Err(anyhow::anyhow!(
            "Polygon returned no aggregates for {} (status={})",
            symbol,
            response.status.unwrap_or_else(|| "unknown".to_string())
        ));
    }

    let observations = results
        .into_iter()
        .filter_map(|agg| timestamp_to_date(agg.timestamp_ms.div_euclid(1000)).map(|d| (d, Some(agg.close))))
        .collect();

    Ok(PriceSeries {
        symbol: symbol.to_string(),
        observations,
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Fetching
// ──────────────────────────────────────────────────────────────────────────────

fn polygon_api_key() -> Option<String> {
    std::env::var("POLYGON_API_KEY")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn fetch_retry_attempts() -> usize {
    std::env::var("PORTFOLIO_FETCH_RETRY_ATTEMPTS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(|v| v.clamp(1, 8))
        .unwrap_or(3)
}

fn batch_fetch_delay_ms() -> u64 {
    std::env::var("PORTFOLIO_BATCH_FETCH_DELAY_MS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|v| v.clamp(0, 5_000))
        .unwrap_or(350)
}

fn cache_dir() -> std::path::PathBuf {
    std::env::var("PORTFOLIO_CACHE_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(".cache"))
}

async fn retry_sleep(attempt: usize) {
    let millis = (500_u64 * (attempt as u64)).min(2_000);
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
}

async fn fetch_json_with_retry<T: DeserializeOwned>(url: &str, symbol: &str, provider: &str) -> Result<T> {
    let attempts = fetch_retry_attempts();
    let client = reqwest::Client::new();
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=attempts {
        match client
            .get(url)
            .header("User-Agent", "Mozilla/5.0")
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await
        {
            Ok(resp) => match resp.error_for_status() {
                Ok(ok_resp) => match ok_resp.json::<T>().await {
                    Ok(parsed) => return Ok(parsed),
                    Err(err) => last_err = Some(err.into()),
                },
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }

        if attempt < attempts {
            warn!(
                "{} history fetch retry for {} ({}/{})",
                provider, symbol, attempt, attempts
            );
            retry_sleep(attempt).await;
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} history fetch failed for {}", provider, symbol)))
}

fn unix_seconds(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

async fn fetch_yahoo_series(symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries> {
    let dir = cache_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    let cache_file = dir.join(format!("{}_{}_{}.json", symbol, start, end));

    let response: YahooChartResponse = if cache_file.exists() {
        let metadata = std::fs::metadata(&cache_file)?;
        let age = std::time::SystemTime::now().duration_since(metadata.modified()?)?;

        if age.as_secs() < 86_400 {
            info!("Loading {} from cache...", symbol);
            let file = std::fs::File::open(&cache_file)?;
            serde_json::from_reader(std::io::BufReader::new(file))?
        } else {
            info!("Cache expired for {}, fetching...", symbol);
            fetch_yahoo_from_api(symbol, start, end, &cache_file).await?
        }
    } else {
        info!("Cache miss for {}, fetching...", symbol);
        fetch_yahoo_from_api(symbol, start, end, &cache_file).await?
    };

    yahoo_response_to_series(symbol, response)
}

async fn fetch_yahoo_from_api(
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
    cache_path: &std::path::Path,
) -> Result<YahooChartResponse> {
    let url = format!(
        "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=div%2Csplit&includeAdjustedClose=true",
        symbol,
        unix_seconds(start),
        unix_seconds(end)
    );
    let response: YahooChartResponse = fetch_json_with_retry(&url, symbol, "Yahoo").await?;

    // A failed cache write only costs a refetch next run.
    match std::fs::File::create(cache_path) {
        Ok(file) => {
            if let Err(e) = serde_json::to_writer(std::io::BufWriter::new(file), &response) {
                warn!("Failed to write cache for {}: {}", symbol, e);
            }
        }
        Err(e) => warn!("Failed to create cache file for {}: {}", symbol, e),
    }

    Ok(response)
}

async fn fetch_polygon_series(symbol: &str, start: NaiveDate, end: NaiveDate, api_key: &str) -> Result<PriceSeries> {
    let url = format!(
        "https://api.polygon.io/v2/aggs/ticker/{}/range/1/day/{}/{}?adjusted=true&sort=asc&limit=50000&apiKey={}",
        symbol,
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d"),
        api_key
    );
    let response: PolygonAggsResponse = fetch_json_with_retry(&url, symbol, "Polygon").await?;
    polygon_response_to_series(symbol, response)
}

/// Trims, upper-cases and de-duplicates symbols, keeping first-seen order.
pub fn normalize_symbols(symbols: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(symbols.len());
    for raw in symbols {
        let symbol = raw.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(anyhow::anyhow!("empty symbol in instrument list"));
        }
        if seen.insert(symbol.clone()) {
            out.push(symbol);
        } else {
            warn!("Duplicate symbol {} ignored", symbol);
        }
    }
    Ok(out)
}

async fn fetch_all_series(symbols: &[String], start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceSeries>> {
    let mode = configured_data_provider_mode();
    let api_key = match mode {
        DataProviderMode::Polygon => Some(
            polygon_api_key()
                .ok_or(anyhow::anyhow!("PORTFOLIO_DATA_PROVIDER=polygon but POLYGON_API_KEY is missing"))?,
        ),
        DataProviderMode::Yfinance => None,
    };
    let delay_ms = batch_fetch_delay_ms();

    let mut out = Vec::with_capacity(symbols.len());
    for (idx, symbol) in symbols.iter().enumerate() {
        let series = match api_key.as_deref() {
            Some(key) => fetch_polygon_series(symbol, start, end, key).await,
            None => fetch_yahoo_series(symbol, start, end).await,
        }
        .map_err(|e| {
            anyhow::anyhow!(
                "historical fetch failed: symbol={}, provider={}, range={}..{}, reason={}",
                symbol,
                mode.as_str(),
                start,
                end,
                e
            )
        })?;
        out.push(series);

        if idx + 1 < symbols.len() && delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
    }
    Ok(out)
}

/// Fetches daily closes for every symbol over `[start, end)` and aligns them.
///
/// The whole retrieval is bounded by `budget`; each request is additionally
/// retried with back-off.
pub async fn fetch_price_table(
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
    budget: std::time::Duration,
) -> Result<PriceTable> {
    if start >= end {
        return Err(anyhow::anyhow!("start date {} must be before end date {}", start, end));
    }
    let symbols = normalize_symbols(symbols)?;
    if symbols.len() < 2 {
        return Err(PortfolioError::InsufficientInstruments { required: 2, actual: symbols.len() }.into());
    }

    info!(
        "Fetching {} symbols from {} ({} .. {})",
        symbols.len(),
        configured_data_provider_mode().as_str(),
        start,
        end
    );

    let series = tokio::time::timeout(budget, fetch_all_series(&symbols, start, end))
        .await
        .map_err(|_| anyhow::anyhow!("market data retrieval exceeded {}s budget", budget.as_secs()))??;

    let table = PriceTable::from_series(series)?;
    if table.len() < 2 {
        return Err(PortfolioError::InsufficientData { required: 2, actual: table.len() }.into());
    }
    let dates = table.dates();
    info!(
        "Aligned price table: {} dates x {} instruments ({} .. {})",
        table.len(),
        table.num_instruments(),
        dates[0],
        dates[dates.len() - 1]
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn syms(s: &[&str]) -> Vec<String> {
        s.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_forward_fill_and_drop_leading_rows() {
        let rows = vec![
            (day(1), vec![Some(10.0), None]),
            (day(2), vec![Some(11.0), Some(20.0)]),
            (day(3), vec![None, Some(21.0)]),
            (day(4), vec![Some(12.0), Some(f64::NAN)]),
        ];
        let table = PriceTable::from_rows(syms(&["AAA", "BBB"]), rows).unwrap();

        assert_eq!(table.dates(), &[day(2), day(3), day(4)]);
        assert_eq!(table.rows()[0], vec![11.0, 20.0]);
        assert_eq!(table.rows()[1], vec![11.0, 21.0]);
        assert_eq!(table.rows()[2], vec![12.0, 21.0]);
        assert!(table.rows().iter().all(|r| r.len() == 2 && r.iter().all(|p| p.is_finite())));
    }

    #[test]
    fn test_from_series_merges_union_of_dates() {
        let a = PriceSeries {
            symbol: "AAA".into(),
            observations: vec![(day(1), Some(1.0)), (day(2), Some(2.0)), (day(4), Some(4.0))],
        };
        let b = PriceSeries {
            symbol: "BBB".into(),
            observations: vec![(day(2), Some(20.0)), (day(3), Some(30.0))],
        };
        let table = PriceTable::from_series(vec![a, b]).unwrap();

        assert_eq!(table.symbols(), &["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(table.dates(), &[day(2), day(3), day(4)]);
        assert_eq!(table.rows()[1], vec![2.0, 30.0]);
        assert_eq!(table.rows()[2], vec![4.0, 30.0]);
    }

    #[test]
    fn test_returns_are_one_row_shorter() {
        let rows = (1..=5).map(|d| (day(d), vec![Some(d as f64), Some(2.0 * d as f64)])).collect();
        let table = PriceTable::from_rows(syms(&["AAA", "BBB"]), rows).unwrap();
        assert_eq!(table.simple_returns().unwrap().len(), table.len() - 1);
    }

    #[test]
    fn test_rejects_unordered_dates_and_duplicates() {
        let rows = vec![(day(2), vec![Some(1.0)]), (day(1), vec![Some(1.0)])];
        assert!(PriceTable::from_rows(syms(&["AAA"]), rows).is_err());

        let rows = vec![(day(1), vec![Some(1.0), Some(1.0)])];
        assert!(matches!(
            PriceTable::from_rows(syms(&["AAA", "AAA"]), rows),
            Err(PortfolioError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_zero_price_is_rejected() {
        let rows = vec![(day(1), vec![Some(0.0)]), (day(2), vec![Some(1.0)])];
        let table = PriceTable::from_rows(syms(&["AAA"]), rows).unwrap();
        assert!(matches!(table.simple_returns(), Err(PortfolioError::InvalidPrice { .. })));
    }

    #[test]
    fn test_yahoo_prefers_adjusted_close() {
        let body = r#"{"chart":{"result":[{"timestamp":[1709217000,1709303400],
            "indicators":{"quote":[{"close":[100.0,101.0]}],
            "adjclose":[{"adjclose":[99.0,100.5]}]}}],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(body).unwrap();
        let series = yahoo_response_to_series("AAA", response).unwrap();
        assert_eq!(series.observations.len(), 2);
        assert_eq!(series.observations[0].1, Some(99.0));
        assert_eq!(series.observations[1].1, Some(100.5));
    }

    #[test]
    fn test_yahoo_falls_back_to_close() {
        let body = r#"{"chart":{"result":[{"timestamp":[1709217000,1709303400],
            "indicators":{"quote":[{"close":[100.0,null]}]}}],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(body).unwrap();
        let series = yahoo_response_to_series("AAA", response).unwrap();
        assert_eq!(series.observations[0].1, Some(100.0));
        assert_eq!(series.observations[1].1, None);
    }

    #[test]
    fn test_yahoo_error_payload_is_data_error() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        let response: YahooChartResponse = serde_json::from_str(body).unwrap();
        assert!(yahoo_response_to_series("ZZZZ", response).is_err());
    }

    #[test]
    fn test_polygon_series_parses_millisecond_timestamps() {
        let body = r#"{"status":"OK","results":[{"t":1709269200000,"c":10.5},{"t":1709355600000,"c":11.0}]}"#;
        let response: PolygonAggsResponse = serde_json::from_str(body).unwrap();
        let series = polygon_response_to_series("AAA", response).unwrap();
        assert_eq!(series.observations.len(), 2);
        assert_eq!(series.observations[0].0, day(1));
        assert_eq!(series.observations[1].1, Some(11.0));
    }

    #[test]
    fn test_normalize_symbols() {
        let out = normalize_symbols(&syms(&[" aapl", "MSFT ", "aapl"])).unwrap();
        assert_eq!(out, vec!["AAPL".to_string(), "MSFT".to_string()]);
        assert!(normalize_symbols(&syms(&["AAPL", "  "])).is_err());
    }

    #[test]
    fn test_provider_mode_parse() {
        assert_eq!(DataProviderMode::parse("Polygon"), DataProviderMode::Polygon);
        assert_eq!(DataProviderMode::parse("yahoo"), DataProviderMode::Yfinance);
        assert_eq!(DataProviderMode::parse("bogus"), DataProviderMode::Yfinance);
    }

    #[tokio::test]
    async fn test_fetch_rejects_inverted_range() {
        let result = fetch_price_table(
            &syms(&["AAA", "BBB"]),
            day(5),
            day(1),
            std::time::Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
    }
}
