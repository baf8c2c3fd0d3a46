//! Configuration for admission control.
//!
//! Limiters are described per route and validated once at wiring time; there
//! is no reconfiguration while running.
//!
//! ```yaml
//! routes:
//!   /limit1:
//!     strategy: token_bucket
//!     capacity: 10000
//!     refill_interval_us: 100
//!   /limit3:
//!     strategy: keyed
//!     rate: 10.0
//!     burst: 10
//!     ttl_secs: 3600
//! ```

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use admit_limit::ConcurrencyLimiter;
use admit_limit::FixedRate;
use admit_limit::KeyedRegistry;
use admit_limit::Quota;
use admit_limit::TokenBucket;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::admission::Limiter;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error(transparent)]
    Invalid(#[from] admit_limit::ConfigError),

    #[error("route {route}: {source}")]
    Route {
        route: String,
        #[source]
        source: Box<LoadError>,
    },
}

/// Limiters keyed by the route they protect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub routes: BTreeMap<String, LimiterConfig>,
}

/// One limiter's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LimiterConfig {
    /// `capacity` tokens, one refilled every `refill_interval_us` microseconds.
    TokenBucket {
        capacity: usize,
        refill_interval_us: u64,
    },

    /// At most `limit` requests in flight.
    Concurrency { limit: usize },

    /// `rate` permits per second, up to `burst` at once.
    FixedRate { rate: f64, burst: u32 },

    /// A separate `rate`/`burst` limiter per client, dropped after `ttl_secs`
    /// without requests.
    Keyed {
        rate: f64,
        burst: u32,
        #[serde(default = "default_ttl_secs")]
        ttl_secs: u64,
        #[serde(default = "default_sweep_interval_secs")]
        sweep_interval_secs: u64,
    },
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    600
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let routes = [
            (
                "/limit1",
                LimiterConfig::TokenBucket {
                    capacity: 10_000,
                    refill_interval_us: 100,
                },
            ),
            ("/limit2", LimiterConfig::Concurrency { limit: 1000 }),
            (
                "/limit3",
                LimiterConfig::Keyed {
                    rate: 10.0,
                    burst: 10,
                    ttl_secs: 3600,
                    sweep_interval_secs: default_sweep_interval_secs(),
                },
            ),
            (
                "/limit4",
                LimiterConfig::FixedRate {
                    rate: 1000.0,
                    burst: 20,
                },
            ),
        ];

        Self {
            routes: routes
                .into_iter()
                .map(|(route, config)| (route.to_string(), config))
                .collect(),
        }
    }
}

impl AdmissionConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, LoadError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Validates every route and builds its limiter.
    pub fn build(&self) -> Result<BTreeMap<String, Limiter>, LoadError> {
        self.routes
            .iter()
            .map(|(route, config)| {
                let limiter = config.build().map_err(|source| LoadError::Route {
                    route: route.clone(),
                    source: Box::new(source),
                })?;
                info!(%route, limiter = limiter.kind(), ?config, "admission limiter configured");
                Ok((route.clone(), limiter))
            })
            .collect()
    }
}

impl LimiterConfig {
    pub fn build(&self) -> Result<Limiter, LoadError> {
        let limiter = match *self {
            Self::TokenBucket {
                capacity,
                refill_interval_us,
            } => Limiter::TokenBucket(Arc::new(TokenBucket::new(
                NonZeroUsize::new(capacity).ok_or(LoadError::NotPositive("capacity"))?,
                Duration::from_micros(refill_interval_us),
            )?)),
            Self::Concurrency { limit } => Limiter::Concurrency(Arc::new(ConcurrencyLimiter::new(
                NonZeroUsize::new(limit).ok_or(LoadError::NotPositive("limit"))?,
            ))),
            Self::FixedRate { rate, burst } => {
                Limiter::FixedRate(Arc::new(FixedRate::new(quota(rate, burst)?)))
            }
            Self::Keyed {
                rate,
                burst,
                ttl_secs,
                sweep_interval_secs,
            } => {
                if sweep_interval_secs == 0 {
                    return Err(LoadError::NotPositive("sweep_interval_secs"));
                }
                Limiter::Keyed {
                    registry: Arc::new(KeyedRegistry::new(Duration::from_secs(ttl_secs))?),
                    quota: quota(rate, burst)?,
                    sweep_every: Duration::from_secs(sweep_interval_secs),
                }
            }
        };
        Ok(limiter)
    }
}

fn quota(rate: f64, burst: u32) -> Result<Quota, LoadError> {
    let burst = NonZeroU32::new(burst).ok_or(LoadError::NotPositive("burst"))?;
    Ok(Quota::new(rate, burst)?)
}

#[cfg(test)]
mod tests {
    use admit_limit::ConfigError;

    use super::*;

    #[test]
    fn default_reproduces_the_protected_routes() {
        let limiters = AdmissionConfig::default().build().unwrap();

        let kinds: Vec<_> = limiters
            .iter()
            .map(|(route, limiter)| (route.as_str(), limiter.kind()))
            .collect();
        assert_eq!(
            kinds,
            [
                ("/limit1", "token_bucket"),
                ("/limit2", "concurrency"),
                ("/limit3", "keyed"),
                ("/limit4", "fixed_rate"),
            ]
        );

        match &limiters["/limit3"] {
            Limiter::Keyed {
                registry,
                quota,
                sweep_every,
            } => {
                assert_eq!(registry.ttl(), Duration::from_secs(3600));
                assert_eq!(quota.burst(), 10);
                assert_eq!(quota.interval(), Duration::from_millis(100));
                assert_eq!(*sweep_every, Duration::from_secs(600));
            }
            other => panic!("expected keyed limiter, got {other:?}"),
        }
    }

    #[test]
    fn parses_yaml_with_defaults() {
        let config = AdmissionConfig::from_yaml(
            r#"
routes:
  /api:
    strategy: keyed
    rate: 2.5
    burst: 5
  /upload:
    strategy: concurrency
    limit: 8
"#,
        )
        .unwrap();

        assert_eq!(
            config.routes["/api"],
            LimiterConfig::Keyed {
                rate: 2.5,
                burst: 5,
                ttl_secs: 300,
                sweep_interval_secs: 600,
            }
        );
        assert_eq!(
            config.routes["/upload"],
            LimiterConfig::Concurrency { limit: 8 }
        );
    }

    #[test]
    fn yaml_round_trips_the_default() {
        let yaml = serde_yaml::to_string(&AdmissionConfig::default()).unwrap();
        assert_eq!(
            AdmissionConfig::from_yaml(&yaml).unwrap(),
            AdmissionConfig::default()
        );
    }

    #[test]
    fn invalid_parameters_name_the_route() {
        let config = AdmissionConfig::from_yaml(
            r#"
routes:
  /broken:
    strategy: fixed_rate
    rate: -1.0
    burst: 3
"#,
        )
        .unwrap();

        let err = config.build().unwrap_err();
        match err {
            LoadError::Route { route, source } => {
                assert_eq!(route, "/broken");
                assert!(matches!(
                    *source,
                    LoadError::Invalid(ConfigError::InvalidRate(_))
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let zero_capacity = LimiterConfig::TokenBucket {
            capacity: 0,
            refill_interval_us: 100,
        };
        assert!(matches!(
            zero_capacity.build(),
            Err(LoadError::NotPositive("capacity"))
        ));

        let zero_interval = LimiterConfig::TokenBucket {
            capacity: 1,
            refill_interval_us: 0,
        };
        assert!(matches!(
            zero_interval.build(),
            Err(LoadError::Invalid(ConfigError::ZeroInterval))
        ));

        let zero_ttl = LimiterConfig::Keyed {
            rate: 1.0,
            burst: 1,
            ttl_secs: 0,
            sweep_interval_secs: 1,
        };
        assert!(matches!(
            zero_ttl.build(),
            Err(LoadError::Invalid(ConfigError::ZeroTtl))
        ));
    }

    #[test]
    fn unknown_strategy_fails_to_parse() {
        let err = AdmissionConfig::from_yaml("routes:\n  /x:\n    strategy: leaky\n").unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
    }
}
