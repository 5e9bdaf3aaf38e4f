/*!
 # Weather overlay

 When rain is forecast, the tail of the strip is turned blue during the
 sunrise. The forecast is reduced to a single rain probability (0-100)
 by a [`RainSource`]; any failure along the way counts as "no rain".
*/

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::color::{Color, BLUE};

/// NWS gridpoint forecasts for Mountain View and San Francisco
pub const DEFAULT_ENDPOINTS: [&str; 2] = [
    "https://api.weather.gov/gridpoints/MTR/93,86/forecast",
    "https://api.weather.gov/gridpoints/MTR/86,106/forecast",
];

/// The NWS API rejects requests without a User-Agent
const USER_AGENT: &str = concat!("sunrise-alarm/", env!("CARGO_PKG_VERSION"));

/// Errors from querying a rain forecast
#[derive(Error, Debug)]
pub enum WeatherError {
    /// HTTP or decoding failure
    #[error("Weather request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-success status
    #[error("Weather service returned status {0}")]
    Status(reqwest::StatusCode),

    /// None of the configured endpoints produced a forecast
    #[error("No forecast endpoint answered")]
    Unavailable,

    /// The query did not finish in time
    #[error("Weather query timed out after {0:?}")]
    Timeout(Duration),
}

/// Something that can tell today's rain probability in percent
pub trait RainSource: Send + Sync {
    /// Queries the probability of rain, 0-100
    fn rain_probability(&self) -> BoxFuture<'_, Result<u8, WeatherError>>;
}

/// A source that never forecasts rain
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRain;

impl RainSource for NoRain {
    fn rain_probability(&self) -> BoxFuture<'_, Result<u8, WeatherError>> {
        Box::pin(async { Ok(0) })
    }
}

/// A source with a fixed answer
#[derive(Debug, Clone, Copy)]
pub struct FixedRain(pub u8);

impl RainSource for FixedRain {
    fn rain_probability(&self) -> BoxFuture<'_, Result<u8, WeatherError>> {
        let probability = self.0.min(100);
        Box::pin(async move { Ok(probability) })
    }
}

/// Queries `source` with a deadline, degrading every failure to 0
#[instrument(skip(source))]
pub async fn query_rain(source: Arc<dyn RainSource>, timeout: Duration) -> u8 {
    let result = match tokio::time::timeout(timeout, source.rain_probability()).await {
        Ok(result) => result,
        Err(_) => Err(WeatherError::Timeout(timeout)),
    };

    match result {
        Ok(probability) => {
            debug!("Rain probability is {}%", probability);
            probability.min(100)
        }
        Err(e) => {
            warn!("Weather unavailable, assuming no rain: {}", e);
            0
        }
    }
}

/// Pixel indices recolored by the overlay: the last `k`, or all if shorter
pub fn overlay_range(led_count: usize, k: usize) -> Range<usize> {
    led_count.saturating_sub(k)..led_count
}

/// Colors of the whole strip with the rain overlay applied to `base`
pub fn rain_overlay(base: Color, led_count: usize, k: usize, probability: u8) -> Vec<Color> {
    let mut pixels = vec![base; led_count];
    if probability > 0 {
        for pixel in &mut pixels[overlay_range(led_count, k)] {
            *pixel = BLUE;
        }
    }
    pixels
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    properties: ForecastProperties,
}

#[derive(Debug, Deserialize)]
struct ForecastProperties {
    #[serde(default)]
    periods: Vec<ForecastPeriod>,
}

/// One period of an NWS forecast
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastPeriod {
    /// ISO 8601 start of the period, local to the forecast office
    #[serde(rename = "startTime")]
    pub start_time: String,
    /// Chance of precipitation
    #[serde(rename = "probabilityOfPrecipitation", default)]
    pub probability_of_precipitation: Option<Quantity>,
}

/// An NWS quantity whose value may be null
#[derive(Debug, Clone, Deserialize)]
pub struct Quantity {
    /// Numeric value, absent when unknown
    pub value: Option<f64>,
}

/// Highest precipitation chance among periods starting on `date`
pub fn max_probability_for_day(periods: &[ForecastPeriod], date: NaiveDate) -> u8 {
    let prefix = date.format("%Y-%m-%d").to_string();
    periods
        .iter()
        .filter(|p| p.start_time.starts_with(&prefix))
        .filter_map(|p| p.probability_of_precipitation.as_ref()?.value)
        .fold(0.0_f64, f64::max)
        .clamp(0.0, 100.0) as u8
}

/// Rain source backed by the National Weather Service forecast API
#[derive(Debug, Clone)]
pub struct NoaaForecast {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl NoaaForecast {
    /// Creates a client for the given gridpoint forecast URLs
    pub fn new<I, S>(endpoints: I) -> Result<Self, WeatherError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        })
    }

    /// Creates a client for [`DEFAULT_ENDPOINTS`]
    pub fn with_default_endpoints() -> Result<Self, WeatherError> {
        Self::new(DEFAULT_ENDPOINTS)
    }

    #[instrument(skip(self))]
    async fn fetch_periods(&self, url: &str) -> Result<Vec<ForecastPeriod>, WeatherError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(WeatherError::Status(response.status()));
        }
        let forecast: ForecastResponse = response.json().await?;
        debug!("Fetched {} forecast periods", forecast.properties.periods.len());
        Ok(forecast.properties.periods)
    }

    /// Highest rain probability for today across all endpoints
    ///
    /// Endpoints that fail are skipped; only when all of them fail is the
    /// whole query an error.
    #[instrument(skip(self))]
    pub async fn max_rain_probability(&self) -> Result<u8, WeatherError> {
        let today = chrono::Local::now().date_naive();
        let mut answered = false;
        let mut max_rain = 0;

        for url in &self.endpoints {
            match self.fetch_periods(url).await {
                Ok(periods) => {
                    answered = true;
                    max_rain = max_rain.max(max_probability_for_day(&periods, today));
                }
                Err(e) => warn!("Skipping forecast from {}: {}", url, e),
            }
        }

        if !answered {
            return Err(WeatherError::Unavailable);
        }
        info!("Today's rain probability is {}%", max_rain);
        Ok(max_rain)
    }
}

impl RainSource for NoaaForecast {
    fn rain_probability(&self) -> BoxFuture<'_, Result<u8, WeatherError>> {
        Box::pin(self.max_rain_probability())
    }
}
