use miam_execution::MAX_DRAW_ATTEMPTS;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SESSION_TTL_MS: u64 = 30 * 60 * 1000;
const DEFAULT_PERSISTENCE_BUFFER: usize = 256;
const DEFAULT_NOTIFY_CONCURRENCY: usize = 4;
const DEFAULT_HTTP_RATE_LIMIT_PER_SECOND: u64 = 50;
const DEFAULT_HTTP_RATE_LIMIT_BURST: u32 = 200;
const DEFAULT_AUTH_RATE_LIMIT_PER_MINUTE: u64 = 10;
const DEFAULT_AUTH_RATE_LIMIT_BURST: u32 = 5;
const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;
pub const DEFAULT_RESEND_BASE_URL: &str = "https://api.resend.com";
pub const DEFAULT_EMAIL_FROM: &str = "MIAM Magical Drawer <drawer@localhost>";

/// Which mail transport to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailerKind {
    /// Deliver through the Resend HTTP API.
    Resend,
    /// Log messages instead of delivering them.
    Log,
    /// Keep messages in memory.
    Outbox,
}

impl std::str::FromStr for MailerKind {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "resend" => Ok(Self::Resend),
            "log" => Ok(Self::Log),
            "outbox" => Ok(Self::Outbox),
            _ => Err("valid values: resend, log, outbox"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MailerConfig {
    pub kind: MailerKind,
    pub from: String,
    pub resend_api_key: Option<String>,
    pub resend_base_url: String,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            kind: MailerKind::Log,
            from: DEFAULT_EMAIL_FROM.to_string(),
            resend_api_key: None,
            resend_base_url: DEFAULT_RESEND_BASE_URL.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// PHC-encoded argon2 hash of the admin password. Admin routes are closed without it.
    pub admin_password_hash: Option<String>,
    pub session_ttl_ms: u64,
    pub sqlite_path: Option<PathBuf>,
    pub postgres_url: Option<String>,
    pub persistence_buffer: Option<usize>,
    pub mailer: MailerConfig,
    pub notify_concurrency: Option<usize>,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub auth_rate_limit_per_minute: Option<u64>,
    pub auth_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
    /// Seed for the draw RNG. Draws are only reproducible when set.
    pub draw_seed: Option<u64>,
    /// Shuffles tried per draw before reporting `draw_failed`.
    pub draw_max_attempts: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_password_hash: None,
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
            sqlite_path: None,
            postgres_url: None,
            persistence_buffer: Some(DEFAULT_PERSISTENCE_BUFFER),
            mailer: MailerConfig::default(),
            notify_concurrency: Some(DEFAULT_NOTIFY_CONCURRENCY),
            http_rate_limit_per_second: Some(DEFAULT_HTTP_RATE_LIMIT_PER_SECOND),
            http_rate_limit_burst: Some(DEFAULT_HTTP_RATE_LIMIT_BURST),
            auth_rate_limit_per_minute: Some(DEFAULT_AUTH_RATE_LIMIT_PER_MINUTE),
            auth_rate_limit_burst: Some(DEFAULT_AUTH_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            draw_seed: None,
            draw_max_attempts: MAX_DRAW_ATTEMPTS,
        }
    }
}

impl ServerConfig {
    /// Configuration for in-process tests: memory-only, outbox mail, no rate limits.
    pub fn for_tests(admin_password_hash: Option<String>) -> Self {
        Self {
            admin_password_hash,
            mailer: MailerConfig {
                kind: MailerKind::Outbox,
                ..MailerConfig::default()
            },
            http_rate_limit_per_second: None,
            http_rate_limit_burst: None,
            auth_rate_limit_per_minute: None,
            auth_rate_limit_burst: None,
            draw_seed: Some(7),
            ..Self::default()
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn persistence_buffer_capacity(&self) -> usize {
        self.persistence_buffer
            .unwrap_or(DEFAULT_PERSISTENCE_BUFFER)
            .max(1)
    }

    pub fn notify_concurrency(&self) -> usize {
        self.notify_concurrency
            .unwrap_or(DEFAULT_NOTIFY_CONCURRENCY)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailer_kind_parses_case_insensitively() {
        assert_eq!("Resend".parse::<MailerKind>().unwrap(), MailerKind::Resend);
        assert_eq!("OUTBOX".parse::<MailerKind>().unwrap(), MailerKind::Outbox);
        assert!("smtp".parse::<MailerKind>().is_err());
    }

    #[test]
    fn capacities_never_zero() {
        let config = ServerConfig {
            persistence_buffer: Some(0),
            notify_concurrency: Some(0),
            ..ServerConfig::default()
        };
        assert_eq!(config.persistence_buffer_capacity(), 1);
        assert_eq!(config.notify_concurrency(), 1);
    }
}
