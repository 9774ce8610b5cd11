use crate::shared::StationAddress;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_RESPONSE_TIMEOUT_MS: i64 = 500;
pub const DEFAULT_POLL_MIN_GAP_MS: i64 = 10;
pub const DEFAULT_RECALL_RETRY_DELAY_MS: i64 = 250;
pub const DEFAULT_CONTROL_COALESCE_WINDOW_MS: i64 = 50;
pub const DEFAULT_FAIL_THRESHOLD: u32 = 3;

/// One polled slave: its address and the remote endpoint its datagrams come
/// from and go to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationEntry {
    pub address: u8,
    pub endpoint: String,
}

/// On-disk master configuration. Durations are integer milliseconds so the
/// file can express (and validation can reject) negative values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub bind_address: String,
    pub response_timeout_ms: i64,
    pub poll_min_gap_ms: i64,
    pub recall_retry_delay_ms: i64,
    pub control_coalesce_window_ms: i64,
    pub secure_polls: bool,
    pub fail_threshold: u32,
    pub control_count: usize,
    pub indication_count: usize,
    pub stations: Vec<StationEntry>,
}

impl Default for MasterConfig {
    fn default() -> MasterConfig {
        MasterConfig {
            bind_address: "0.0.0.0:5700".into(),
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            poll_min_gap_ms: DEFAULT_POLL_MIN_GAP_MS,
            recall_retry_delay_ms: DEFAULT_RECALL_RETRY_DELAY_MS,
            control_coalesce_window_ms: DEFAULT_CONTROL_COALESCE_WINDOW_MS,
            secure_polls: false,
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
            control_count: 64,
            indication_count: 64,
            stations: vec![StationEntry {
                address: 1,
                endpoint: "127.0.0.1:5701".into(),
            }],
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(serdeconv::Error),
    NegativeDuration(&'static str),
    NoStations,
    ReservedStation,
    DuplicateStation(u8),
    BadEndpoint(String),
    BadBindAddress(String),
    ZeroFailThreshold,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config load failed: {}", err),
            ConfigError::NegativeDuration(field) => {
                write!(f, "duration field {} is negative", field)
            }
            ConfigError::NoStations => write!(f, "at least one station is required"),
            ConfigError::ReservedStation => write!(f, "station address 0 is reserved"),
            ConfigError::DuplicateStation(raw) => {
                write!(f, "station address {} appears twice", raw)
            }
            ConfigError::BadEndpoint(endpoint) => {
                write!(f, "unparseable station endpoint {}", endpoint)
            }
            ConfigError::BadBindAddress(address) => {
                write!(f, "unparseable bind address {}", address)
            }
            ConfigError::ZeroFailThreshold => write!(f, "fail threshold must be at least 1"),
        }
    }
}

impl From<serdeconv::Error> for ConfigError {
    #[inline]
    fn from(err: serdeconv::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// Configuration after validation: parsed addresses, real durations, stations
/// sorted ascending.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub bind_address: SocketAddr,
    pub response_timeout: Duration,
    pub poll_min_gap: Duration,
    pub recall_retry_delay: Duration,
    pub control_coalesce_window: Duration,
    pub secure_polls: bool,
    pub fail_threshold: u32,
    pub control_count: usize,
    pub indication_count: usize,
    pub stations: Vec<(StationAddress, SocketAddr)>,
}

impl ValidatedConfig {
    #[inline]
    pub fn station_addresses(&self) -> Vec<StationAddress> {
        self.stations.iter().map(|&(station, _)| station).collect()
    }
}

impl MasterConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<MasterConfig, ConfigError> {
        let config = serdeconv::from_toml_file(path)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let response_timeout = duration_field(self.response_timeout_ms, "response_timeout_ms")?;
        let poll_min_gap = duration_field(self.poll_min_gap_ms, "poll_min_gap_ms")?;
        let recall_retry_delay =
            duration_field(self.recall_retry_delay_ms, "recall_retry_delay_ms")?;
        let control_coalesce_window =
            duration_field(self.control_coalesce_window_ms, "control_coalesce_window_ms")?;

        if self.fail_threshold == 0 {
            return Err(ConfigError::ZeroFailThreshold);
        }

        if self.stations.is_empty() {
            return Err(ConfigError::NoStations);
        }

        let bind_address = self
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::BadBindAddress(self.bind_address.clone()))?;

        let mut stations = Vec::with_capacity(self.stations.len());

        for entry in &self.stations {
            let station =
                StationAddress::new(entry.address).ok_or(ConfigError::ReservedStation)?;
            let endpoint = entry
                .endpoint
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::BadEndpoint(entry.endpoint.clone()))?;

            stations.push((station, endpoint));
        }

        stations.sort_by_key(|&(station, _)| station);

        for pair in stations.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(ConfigError::DuplicateStation(pair[0].0.raw()));
            }
        }

        Ok(ValidatedConfig {
            bind_address,
            response_timeout,
            poll_min_gap,
            recall_retry_delay,
            control_coalesce_window,
            secure_polls: self.secure_polls,
            fail_threshold: self.fail_threshold,
            control_count: self.control_count,
            indication_count: self.indication_count,
            stations,
        })
    }
}

#[inline]
fn duration_field(millis: i64, field: &'static str) -> Result<Duration, ConfigError> {
    if millis < 0 {
        return Err(ConfigError::NegativeDuration(field));
    }

    Ok(Duration::from_millis(millis as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_stations(entries: Vec<StationEntry>) -> MasterConfig {
        MasterConfig {
            stations: entries,
            ..MasterConfig::default()
        }
    }

    #[test]
    fn test_default_validates() {
        let validated = MasterConfig::default().validate().unwrap();

        assert_eq!(validated.response_timeout, Duration::from_millis(500));
        assert_eq!(validated.poll_min_gap, Duration::from_millis(10));
        assert_eq!(validated.recall_retry_delay, Duration::from_millis(250));
        assert_eq!(
            validated.control_coalesce_window,
            Duration::from_millis(50)
        );
        assert_eq!(validated.fail_threshold, 3);
        assert!(!validated.secure_polls);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let config = MasterConfig {
            response_timeout_ms: -1,
            ..MasterConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::NegativeDuration("response_timeout_ms"))
        ));
    }

    #[test]
    fn test_zero_duration_accepted() {
        let config = MasterConfig {
            control_coalesce_window_ms: 0,
            ..MasterConfig::default()
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_stations_rejected() {
        let config = config_with_stations(Vec::new());

        assert!(matches!(config.validate(), Err(ConfigError::NoStations)));
    }

    #[test]
    fn test_station_zero_rejected() {
        let config = config_with_stations(vec![StationEntry {
            address: 0,
            endpoint: "127.0.0.1:5701".into(),
        }]);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReservedStation)
        ));
    }

    #[test]
    fn test_duplicate_station_rejected() {
        let config = config_with_stations(vec![
            StationEntry {
                address: 7,
                endpoint: "127.0.0.1:5701".into(),
            },
            StationEntry {
                address: 7,
                endpoint: "127.0.0.1:5702".into(),
            },
        ]);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateStation(7))
        ));
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        let config = config_with_stations(vec![StationEntry {
            address: 1,
            endpoint: "not-an-endpoint".into(),
        }]);

        assert!(matches!(config.validate(), Err(ConfigError::BadEndpoint(_))));
    }

    #[test]
    fn test_zero_fail_threshold_rejected() {
        let config = MasterConfig {
            fail_threshold: 0,
            ..MasterConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroFailThreshold)
        ));
    }

    #[test]
    fn test_stations_sorted_ascending() {
        let config = config_with_stations(vec![
            StationEntry {
                address: 9,
                endpoint: "127.0.0.1:5709".into(),
            },
            StationEntry {
                address: 2,
                endpoint: "127.0.0.1:5702".into(),
            },
        ]);

        let validated = config.validate().unwrap();
        let addresses: Vec<u8> = validated
            .stations
            .iter()
            .map(|&(station, _)| station.raw())
            .collect();

        assert_eq!(addresses, vec![2, 9]);
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml = serdeconv::to_toml_string(&MasterConfig::default()).unwrap();
        let parsed: MasterConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(parsed.stations.len(), 1);
        assert_eq!(parsed.response_timeout_ms, DEFAULT_RESPONSE_TIMEOUT_MS);
    }
}
