use std::collections::HashMap;
use std::time::Duration;

use crate::queue::QueueConfig;
use crate::types::{Backoff, Provider};

/// Connection parameters for an external queue backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConnection {
    pub host: String,
    pub port: u16,
}

impl QueueConnection {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl Default for QueueConnection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
        }
    }
}

/// Configuration handed to every pipeline component at construction.
#[derive(Clone)]
pub struct IntakeConfig {
    /// HMAC secret per provider. Providers without a secret are rejected.
    pub secrets: HashMap<Provider, Vec<u8>>,

    /// Failed attempts allowed per event before dead-lettering.
    pub max_retries: u32,

    /// Base delay of the exponential backoff.
    pub backoff_base: Duration,

    /// Optional ceiling on a single backoff delay.
    pub backoff_max: Option<Duration>,

    /// How long a worker may hold a job before it is redelivered.
    pub lease_timeout: Duration,

    /// Longest a worker waits before re-checking the queue.
    pub poll_interval: Duration,

    pub worker_count: usize,

    /// Recently completed job ids kept for inspection.
    pub completed_retention: usize,

    /// Dead-letter entries kept in memory.
    pub dlq_capacity: usize,

    pub queue_connection: QueueConnection,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            secrets: HashMap::new(),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: None,
            lease_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            worker_count,
            completed_retention: 10,
            dlq_capacity: 10_000,
            queue_connection: QueueConnection::default(),
        }
    }
}

impl std::fmt::Debug for IntakeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<&Provider> = self.secrets.keys().collect();
        f.debug_struct("IntakeConfig")
            .field("secrets", &providers)
            .field("max_retries", &self.max_retries)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("lease_timeout", &self.lease_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("worker_count", &self.worker_count)
            .field("completed_retention", &self.completed_retention)
            .field("dlq_capacity", &self.dlq_capacity)
            .field("queue_connection", &self.queue_connection)
            .finish()
    }
}

impl IntakeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from environment variables, falling back to defaults.
    ///
    /// Reads `STRIPE_WEBHOOK_SECRET`, `PAYPAL_WEBHOOK_SECRET`,
    /// `GITHUB_WEBHOOK_SECRET`, `REDIS_HOST`, `REDIS_PORT`,
    /// `WEBHOOK_MAX_RETRIES`, `WEBHOOK_BACKOFF_BASE_MS`,
    /// `WEBHOOK_BACKOFF_MAX_MS` and `WEBHOOK_WORKER_COUNT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        for (provider, key) in [
            (Provider::Stripe, "STRIPE_WEBHOOK_SECRET"),
            (Provider::Paypal, "PAYPAL_WEBHOOK_SECRET"),
            (Provider::Github, "GITHUB_WEBHOOK_SECRET"),
        ] {
            if let Some(secret) = lookup(key).filter(|s| !s.is_empty()) {
                config.secrets.insert(provider, secret.into_bytes());
            }
        }

        if let Some(host) = lookup("REDIS_HOST") {
            config.queue_connection.host = host;
        }
        if let Some(port) = parse_var(&lookup, "REDIS_PORT") {
            config.queue_connection.port = port;
        }
        if let Some(max_retries) = parse_var::<u32, _>(&lookup, "WEBHOOK_MAX_RETRIES") {
            config.max_retries = max_retries.max(1);
        }
        if let Some(ms) = parse_var(&lookup, "WEBHOOK_BACKOFF_BASE_MS") {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "WEBHOOK_BACKOFF_MAX_MS") {
            config.backoff_max = Some(Duration::from_millis(ms));
        }
        if let Some(count) = parse_var::<usize, _>(&lookup, "WEBHOOK_WORKER_COUNT") {
            config.worker_count = count.max(1);
        }

        config
    }

    pub fn with_secret(mut self, provider: Provider, secret: impl Into<Vec<u8>>) -> Self {
        self.secrets.insert(provider, secret.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Option<Duration>) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn backoff(&self) -> Backoff {
        let backoff = Backoff::exponential(self.backoff_base);
        match self.backoff_max {
            Some(max) => backoff.with_max(max),
            None => backoff,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            lease_timeout: self.lease_timeout,
            poll_interval: self.poll_interval,
            completed_retention: self.completed_retention,
            dlq_capacity: self.dlq_capacity,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}
