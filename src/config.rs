//! Configuration management
//!
//! An external collaborator (file + environment) loads this; the core
//! consumes the resolved struct.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

use crate::execution::FillPriceRule;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub run: RunConfig,
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Backtest,
    Live,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub mode: RunMode,
    /// Instrument universe; empty means "whatever the feed produces"
    #[serde(default)]
    pub instruments: Vec<String>,
    /// Backtest time range (inclusive); ignored in live mode
    pub start: Option<chrono::DateTime<chrono::Utc>>,
    pub end: Option<chrono::DateTime<chrono::Utc>>,
    /// Live-mode timer tick interval; no timer events when unset. The
    /// replay feed emits its own tick per timestamp instead.
    pub timer_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortfolioConfig {
    pub initial_cash: Decimal,
    /// How far cash may go below zero before orders are rejected
    pub margin_tolerance: Decimal,
    #[serde(default)]
    pub sizing: SizingConfig,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::new(100_000, 0),
            margin_tolerance: Decimal::ZERO,
            sizing: SizingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SizingConfig {
    FixedQuantity { quantity: Decimal },
    TargetWeight { weight: Decimal, lot_size: Decimal },
}

impl Default for SizingConfig {
    fn default() -> Self {
        SizingConfig::TargetWeight {
            weight: Decimal::new(10, 2),  // 10% of equity
            lot_size: Decimal::new(100, 0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub fill_price: FillPriceRule,
    #[serde(default)]
    pub commission: CommissionConfig,
    #[serde(default)]
    pub slippage: SlippageConfig,
    /// Fraction of a bar's volume fillable per bar in simulation
    pub volume_limit: Option<Decimal>,
    /// Seconds to wait for a venue cancel confirmation before forcing
    /// local closure (live mode)
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_secs: u64,
}

fn default_cancel_timeout() -> u64 {
    10
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fill_price: FillPriceRule::Open,
            commission: CommissionConfig::default(),
            slippage: SlippageConfig::default(),
            volume_limit: None,
            cancel_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CommissionConfig {
    #[default]
    None,
    Percent {
        rate: Decimal,
    },
    PerShare {
        per_share: Decimal,
        minimum: Decimal,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SlippageConfig {
    #[default]
    None,
    Percent {
        rate: Decimal,
    },
    Random {
        max_rate: Decimal,
        seed: u64,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskLimits {
    pub max_order_quantity: Option<Decimal>,
    pub max_order_notional: Option<Decimal>,
}

impl RiskLimits {
    pub fn is_unbounded(&self) -> bool {
        self.max_order_quantity.is_none() && self.max_order_notional.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Momentum window length in bars
    pub momentum_period: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self { momentum_period: 20 }
    }
}

impl Config {
    /// Load configuration from file, with environment overrides under the
    /// `TRADEWIND` prefix.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_str().ok_or_else(|| {
            anyhow::anyhow!("config path is not valid UTF-8")
        })?;
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TRADEWIND").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    /// Load from default locations
    pub fn load_default() -> anyhow::Result<Self> {
        let paths = ["tradewind.toml", "~/.config/tradewind/config.toml"];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load(expanded.as_ref());
            }
        }

        anyhow::bail!("no configuration file found")
    }
}
