//! Server configuration

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reconciliation server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; in-memory storage when unset in development
    pub database_url: Option<String>,
    /// HTTP port (health check)
    pub http_port: u16,
    /// Environment: development | staging | production
    pub environment: String,
    pub log_level: String,
    pub log_json: bool,
    pub log_dir: Option<String>,
    /// Credential vault key material (any length; SHA-256 derived unless 32 bytes)
    pub vault_key: String,
    /// VAT rate as a fraction (0.1 = 10%)
    pub vat_rate: Decimal,
    /// Allowed absolute difference when reconciling settlement totals
    pub settlement_tolerance: Decimal,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_max_attempts: u32,
    /// Fraction of the delay randomly shaved off (0.0 - 1.0)
    pub retry_jitter: f64,
    pub shipment_max_retries: i32,
    pub sync_interval: Duration,
    /// How far back the first scheduled sync of a store reaches
    pub sync_initial_lookback: Duration,
    pub retry_scan_interval: Duration,
    pub posting_scan_interval: Duration,
    pub shipment_scan_interval: Duration,
    pub worker_concurrency: usize,
    /// POSTING_REQUESTED claims older than this are released
    pub stale_claim: Duration,
    pub suggestion_min_confidence: f64,
    pub posting_items: PostingItemCodes,
}

/// ERP item codes used for non-product posting lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingItemCodes {
    pub shipping_fee: String,
    pub commission: String,
    pub pg_fee: String,
    pub receipt: String,
}

impl Default for PostingItemCodes {
    fn default() -> Self {
        Self {
            shipping_fee: "SHIPPING-FEE".into(),
            commission: "MARKET-COMMISSION".into(),
            pg_fee: "PG-FEE".into(),
            receipt: "MARKET-RECEIPT".into(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, BoxError> {
        Self::from_source(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_source<F>(lookup: F) -> Result<Self, BoxError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".into());
        let database_url = lookup("DATABASE_URL").filter(|s| !s.is_empty());
        if database_url.is_none() && environment != "development" {
            return Err(format!("DATABASE_URL must be set in {environment} environment").into());
        }

        let secs = |name: &str, default: u64| -> Result<Duration, BoxError> {
            Ok(Duration::from_secs(parse_or(&lookup, name, default)?))
        };
        let defaults = PostingItemCodes::default();
        let vat_rate: Decimal = parse_or(&lookup, "VAT_RATE", Decimal::new(1, 1))?;
        if vat_rate.is_sign_negative() && !vat_rate.is_zero() {
            return Err(format!("VAT_RATE must not be negative, got {vat_rate}").into());
        }

        Ok(Self {
            database_url,
            http_port: parse_or(&lookup, "HTTP_PORT", 8080)?,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_json: parse_or(&lookup, "LOG_JSON", false)?,
            log_dir: lookup("LOG_DIR").filter(|s| !s.is_empty()),
            vault_key: require_secret(&lookup, "VAULT_KEY", &environment)?,
            vat_rate,
            settlement_tolerance: parse_or(&lookup, "SETTLEMENT_TOLERANCE", Decimal::TEN)?,
            retry_base_delay: secs("RETRY_BASE_DELAY_SECS", 30)?,
            retry_max_delay: secs("RETRY_MAX_DELAY_SECS", 3600)?,
            retry_max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 5)?,
            retry_jitter: parse_or::<f64, _>(&lookup, "RETRY_JITTER", 0.2)?.clamp(0.0, 1.0),
            shipment_max_retries: parse_or(&lookup, "SHIPMENT_MAX_RETRIES", 5)?,
            sync_interval: secs("SYNC_INTERVAL_SECS", 600)?,
            sync_initial_lookback: secs("SYNC_INITIAL_LOOKBACK_SECS", 86_400)?,
            retry_scan_interval: secs("RETRY_SCAN_INTERVAL_SECS", 30)?,
            posting_scan_interval: secs("POSTING_SCAN_INTERVAL_SECS", 60)?,
            shipment_scan_interval: secs("SHIPMENT_SCAN_INTERVAL_SECS", 60)?,
            worker_concurrency: parse_or::<usize, _>(&lookup, "WORKER_CONCURRENCY", 8)?.max(1),
            stale_claim: secs("STALE_CLAIM_SECS", 900)?,
            suggestion_min_confidence: parse_or(&lookup, "SUGGESTION_MIN_CONFIDENCE", 0.6)?,
            posting_items: PostingItemCodes {
                shipping_fee: lookup("SHIPPING_FEE_ITEM_CODE").unwrap_or(defaults.shipping_fee),
                commission: lookup("COMMISSION_ITEM_CODE").unwrap_or(defaults.commission),
                pg_fee: lookup("PG_FEE_ITEM_CODE").unwrap_or(defaults.pg_fee),
                receipt: lookup("RECEIPT_ITEM_CODE").unwrap_or(defaults.receipt),
            },
            environment,
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

/// Require a secret env var: must be set and non-empty in non-development environments.
fn require_secret<F>(lookup: &F, name: &str, environment: &str) -> Result<String, BoxError>
where
    F: Fn(&str) -> Option<String>,
{
    let val = match lookup(name) {
        Some(v) => v,
        None => {
            if environment != "development" {
                return Err(format!("{name} must be set in {environment} environment").into());
            }
            format!("dev-{name}-not-for-production")
        }
    };
    if val.is_empty() && environment != "development" {
        return Err(format!("{name} must not be empty in {environment} environment").into());
    }
    Ok(val)
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BoxError::from(format!("{name}: invalid value {raw:?}: {e}"))),
        None => Ok(default),
    }
}
