//! Service configuration.
//!
//! - `RES_WORKERS`: maximum number of groups executing handlers at once (default: 32)
//! - `RES_INBOUND_BUFFER`: capacity of the inbound message channel (default: 1024)

const DEFAULT_WORKERS: usize = 32;
const DEFAULT_INBOUND_BUFFER: usize = 1024;

/// Runtime settings for a [`Service`](crate::service::Service).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Size of the worker pool draining the task queue.
    pub workers: usize,
    /// Capacity of the channel handed out by `ServiceHandle::inbound`.
    pub inbound_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            inbound_buffer: DEFAULT_INBOUND_BUFFER,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str, default: usize| {
            lookup(key)
                .and_then(|s| s.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };

        Self {
            workers: parse("RES_WORKERS", DEFAULT_WORKERS),
            inbound_buffer: parse("RES_INBOUND_BUFFER", DEFAULT_INBOUND_BUFFER),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = [("RES_WORKERS", "4"), ("RES_INBOUND_BUFFER", "oops")].into();
        let config = ServiceConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.workers, 4);
        assert_eq!(config.inbound_buffer, DEFAULT_INBOUND_BUFFER);
    }

    #[test]
    fn test_zero_workers_falls_back() {
        let config = ServiceConfig::from_lookup(|_| Some("0".to_string()));
        assert_eq!(config, ServiceConfig::default());
    }
}
