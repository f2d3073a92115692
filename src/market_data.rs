//! Market data adapters
//!
//! Bars come from the Binance klines REST API, with a seeded random walk as
//! the fallback when the exchange is unreachable or returns nothing.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::MarketDataConfig;
use crate::error::{SimError, SimResult};
use crate::models::PriceBar;

/// Binance limit per klines request
const KLINES_PER_REQUEST: i64 = 1000;

/// Yes/no quotes implied by an intrabar move
///
/// `yes = clamp(50 + sensitivity * move%, 1, 99)`, `no = 100 - yes`.
pub fn binary_prices(open: f64, close: f64, sensitivity: f64) -> (f64, f64) {
    let move_pct = if open > 0.0 { (close - open) / open * 100.0 } else { 0.0 };
    let yes = (50.0 + sensitivity * move_pct).clamp(1.0, 99.0);
    (yes, 100.0 - yes)
}

/// Start of the bar interval containing `ts`
pub fn align_to_interval(ts: DateTime<Utc>, interval_minutes: u32) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(interval_minutes.max(1) as i64))
        .unwrap_or(ts)
}

/// Bars from a JSON array file, sorted by timestamp
pub fn load_bars_file(path: &Path) -> Result<Vec<PriceBar>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bars file: {}", path.display()))?;
    let mut bars: Vec<PriceBar> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse bars file: {}", path.display()))?;
    bars.sort_by_key(|b| b.timestamp);
    info!("Loaded {} bars from {}", bars.len(), path.display());
    Ok(bars)
}

/// Async provider of price bars
#[allow(async_fn_in_trait)]
pub trait MarketDataSource {
    fn name(&self) -> &str;

    /// Most recent completed bar
    async fn fetch_latest(&self) -> Result<PriceBar>;

    /// Bars in [start, end), oldest first
    async fn fetch_history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PriceBar>>;
}

/// Synchronous bar producer used as the fallback
pub trait BarGenerator {
    fn generate(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> SimResult<Vec<PriceBar>>;

    fn next_bar(&mut self, timestamp: DateTime<Utc>) -> SimResult<PriceBar>;
}

// ============================================================================
// Binance
// ============================================================================

#[derive(Debug, Clone)]
struct Kline {
    open_time: DateTime<Utc>,
    open: f64,
    close: f64,
    volume: f64,
}

/// Binance klines client producing binary-market bars
pub struct BinanceBarSource {
    http: reqwest::Client,
    base_url: String,
    symbol: String,
    interval_minutes: u32,
    include_sub_bars: bool,
    sensitivity: f64,
}

impl BinanceBarSource {
    pub fn new(config: &MarketDataConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            symbol: config.symbol.clone(),
            interval_minutes: config.bar_interval_minutes,
            include_sub_bars: config.include_sub_bars,
            sensitivity: config.price_sensitivity,
        })
    }

    fn interval(&self) -> Duration {
        Duration::minutes(self.interval_minutes as i64)
    }

    async fn fetch_klines(
        &self,
        interval: &str,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Kline>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&limit={}",
            self.base_url,
            self.symbol,
            interval,
            start_time.timestamp_millis(),
            limit
        );
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end.timestamp_millis() - 1));
        }

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to fetch klines")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Binance API error: {} - {}", status, text));
        }

        // Binance returns klines as arrays of arrays
        let data: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse klines response")?;

        let mut klines = Vec::with_capacity(data.len());
        for row in data {
            if row.len() < 6 {
                continue;
            }
            let open_ms = row[0].as_i64().unwrap_or(0);
            let open_time = Utc
                .timestamp_millis_opt(open_ms)
                .single()
                .ok_or_else(|| anyhow!("Invalid kline open time: {}", open_ms))?;

            klines.push(Kline {
                open_time,
                open: parse_f64(&row[1])?,
                close: parse_f64(&row[4])?,
                volume: parse_f64(&row[5])?,
            });
        }

        Ok(klines)
    }

    /// Paginate klines over a range
    async fn fetch_range(
        &self,
        interval: &str,
        step: Duration,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>> {
        let mut all = Vec::new();
        let mut cursor = start;

        while cursor < end {
            let batch_end = (cursor + step * KLINES_PER_REQUEST as i32).min(end);
            let klines = self
                .fetch_klines(interval, cursor, Some(batch_end), KLINES_PER_REQUEST)
                .await?;
            if klines.is_empty() {
                warn!("No {} klines returned for {} to {}", interval, cursor, batch_end);
            }
            all.extend(klines);
            cursor = batch_end;

            // stay well under the 1200 req/min weight limit
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        Ok(all)
    }

    /// 1-minute closes grouped by the bar they fall in
    async fn fetch_sub_bars(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, Vec<f64>>> {
        let minutes = self.fetch_range("1m", Duration::minutes(1), start, end).await?;
        let bucket_ms = self.interval().num_milliseconds();

        let mut grouped: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for k in minutes {
            let ms = k.open_time.timestamp_millis();
            grouped.entry(ms - ms.rem_euclid(bucket_ms)).or_default().push(k.close);
        }
        Ok(grouped)
    }

    fn to_bars(&self, klines: Vec<Kline>, mut sub_bars: BTreeMap<i64, Vec<f64>>) -> Vec<PriceBar> {
        klines
            .into_iter()
            .map(|k| {
                let (yes, no) = binary_prices(k.open, k.close, self.sensitivity);
                let subs = sub_bars
                    .remove(&k.open_time.timestamp_millis())
                    .unwrap_or_default();
                PriceBar::new(k.open_time, k.close, yes, no)
                    .with_volume(k.volume)
                    .with_sub_bars(subs)
            })
            .collect()
    }
}

impl MarketDataSource for BinanceBarSource {
    fn name(&self) -> &str {
        "binance"
    }

    async fn fetch_latest(&self) -> Result<PriceBar> {
        let interval = format!("{}m", self.interval_minutes);
        let now = Utc::now();
        let klines = self
            .fetch_klines(&interval, now - self.interval() * 2, None, 2)
            .await?;
        // the newest kline is usually still open
        let latest = klines
            .iter()
            .rev()
            .find(|k| k.open_time + self.interval() <= now)
            .or(klines.last())
            .cloned()
            .ok_or_else(|| anyhow!("No klines returned for {}", self.symbol))?;

        let sub_bars = if self.include_sub_bars {
            let bar_end = latest.open_time + self.interval();
            self.fetch_sub_bars(latest.open_time, bar_end).await?
        } else {
            BTreeMap::new()
        };

        self.to_bars(vec![latest], sub_bars)
            .pop()
            .ok_or_else(|| anyhow!("No bar built for {}", self.symbol))
    }

    async fn fetch_history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PriceBar>> {
        let interval = format!("{}m", self.interval_minutes);
        info!(
            "Fetching {} {} bars from {} to {}",
            self.symbol, interval, start, end
        );

        let klines = self.fetch_range(&interval, self.interval(), start, end).await?;
        let sub_bars = if self.include_sub_bars {
            self.fetch_sub_bars(start, end).await?
        } else {
            BTreeMap::new()
        };

        let bars = self.to_bars(klines, sub_bars);
        info!("Fetched {} bars", bars.len());
        Ok(bars)
    }
}

fn parse_f64(value: &serde_json::Value) -> Result<f64> {
    let s = value.as_str().unwrap_or("0");
    s.parse::<f64>()
        .with_context(|| format!("Failed to parse kline value: {}", s))
}

// ============================================================================
// Synthetic fallback
// ============================================================================

/// Seeded random walk emitting bars with minute-level sub-bars
pub struct SyntheticBarGenerator {
    rng: StdRng,
    step: Option<Normal>,
    last_price: f64,
    interval_minutes: u32,
    include_sub_bars: bool,
    sensitivity: f64,
}

impl SyntheticBarGenerator {
    pub fn new(config: &MarketDataConfig, seed: Option<u64>) -> SimResult<Self> {
        let step = if config.fallback_volatility > 0.0 {
            Some(
                Normal::new(0.0, config.fallback_volatility)
                    .map_err(|e| SimError::Config(format!("fallback volatility: {}", e)))?,
            )
        } else {
            None
        };
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            rng,
            step,
            last_price: config.fallback_start_price,
            interval_minutes: config.bar_interval_minutes.max(1),
            include_sub_bars: config.include_sub_bars,
            sensitivity: config.price_sensitivity,
        })
    }

    fn walk_minute(&mut self) -> f64 {
        let ret = self.step.as_ref().map(|n| n.sample(&mut self.rng)).unwrap_or(0.0);
        self.last_price = (self.last_price * (1.0 + ret)).max(0.01);
        self.last_price
    }
}

impl BarGenerator for SyntheticBarGenerator {
    fn generate(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> SimResult<Vec<PriceBar>> {
        let interval = Duration::minutes(self.interval_minutes as i64);
        let mut bars = Vec::new();
        let mut ts = start;
        while ts < end {
            bars.push(self.next_bar(ts)?);
            ts += interval;
        }
        debug!("Generated {} synthetic bars", bars.len());
        Ok(bars)
    }

    fn next_bar(&mut self, timestamp: DateTime<Utc>) -> SimResult<PriceBar> {
        let open = self.last_price;
        let minutes: Vec<f64> = (0..self.interval_minutes).map(|_| self.walk_minute()).collect();
        let close = self.last_price;
        if !close.is_finite() {
            return Err(SimError::DataSource("synthetic walk diverged".to_string()));
        }

        let (yes, no) = binary_prices(open, close, self.sensitivity);
        let bar = PriceBar::new(timestamp, close, yes, no);
        Ok(if self.include_sub_bars {
            bar.with_sub_bars(minutes)
        } else {
            bar
        })
    }
}

// ============================================================================
// Fallback loading
// ============================================================================

/// History from the source, or from the generator when the source fails
pub async fn load_history<S, G>(
    source: &S,
    fallback: &mut G,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> SimResult<Vec<PriceBar>>
where
    S: MarketDataSource,
    G: BarGenerator,
{
    match source.fetch_history(start, end).await {
        Ok(bars) if !bars.is_empty() => return Ok(bars),
        Ok(_) => warn!("{} returned no bars, using synthetic data", source.name()),
        Err(e) => warn!("{} history failed ({:#}), using synthetic data", source.name(), e),
    }

    let bars = fallback.generate(start, end)?;
    if bars.is_empty() {
        return Err(SimError::DataSource(format!(
            "no bars available between {} and {}",
            start, end
        )));
    }
    Ok(bars)
}

/// Latest bar from the source, or a generated one stamped `timestamp`
pub async fn load_latest<S, G>(source: &S, fallback: &mut G, timestamp: DateTime<Utc>) -> SimResult<PriceBar>
where
    S: MarketDataSource,
    G: BarGenerator,
{
    match source.fetch_latest().await {
        Ok(bar) => Ok(bar),
        Err(e) => {
            warn!("{} latest bar failed ({:#}), using synthetic data", source.name(), e);
            fallback.next_bar(timestamp)
        }
    }
}
