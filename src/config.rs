use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::engine::EngineConfig;
use crate::limits::MAX_BOOKING_HORIZON_DAYS;
use crate::model::CapacityMode;

/// Server settings, read from `DOCENT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// User ids that get the admin role.
    pub admins: HashSet<String>,
    /// Zero disables the completion sweep.
    pub sweep_interval: Duration,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let capacity_mode = match get("DOCENT_CAPACITY_MODE") {
            None => CapacityMode::default(),
            Some(s) => CapacityMode::parse(&s).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("DOCENT_CAPACITY_MODE must be per_booking or per_visitor, got {s:?}"),
                )
            })?,
        };

        let mut booking_horizon_days: i64 = parsed(&get, "DOCENT_BOOKING_HORIZON_DAYS").unwrap_or(30);
        if !(0..=MAX_BOOKING_HORIZON_DAYS).contains(&booking_horizon_days) {
            warn!("DOCENT_BOOKING_HORIZON_DAYS={booking_horizon_days} out of range, clamping");
            booking_horizon_days = booking_horizon_days.clamp(0, MAX_BOOKING_HORIZON_DAYS);
        }

        let admins = get("DOCENT_ADMINS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            port: parsed(&get, "DOCENT_PORT").unwrap_or(5433),
            bind: get("DOCENT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("DOCENT_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: get("DOCENT_PASSWORD").unwrap_or_else(|| "docent".into()),
            max_connections: parsed(&get, "DOCENT_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&get, "DOCENT_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&get, "DOCENT_METRICS_PORT"),
            tls_cert: get("DOCENT_TLS_CERT"),
            tls_key: get("DOCENT_TLS_KEY"),
            admins,
            sweep_interval: Duration::from_secs(parsed(&get, "DOCENT_SWEEP_INTERVAL_SECS").unwrap_or(60)),
            engine: EngineConfig {
                booking_horizon_days,
                capacity_mode,
                default_slot_capacity: parsed(&get, "DOCENT_DEFAULT_SLOT_CAPACITY").unwrap_or(30),
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("docent.wal")
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| parse_or_warn(key, &s))
}

fn parse_or_warn<T: FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        warn!("ignoring unparseable {key}={value:?}");
    }
    parsed
}
