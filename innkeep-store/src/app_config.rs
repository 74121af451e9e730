use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub stripe: StripeConfig,
    pub auth: AuthConfig,
    pub saga: SagaConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub booking_topic: String,
    pub settlement_topic: String,
    /// Partition key shared by every booking event
    pub event_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub publishable_key: String,
    #[serde(default = "default_stripe_base_url")]
    pub base_url: String,
    pub success_url: String,
    pub cancel_url: String,
    #[serde(default = "default_stripe_timeout")]
    pub timeout_ms: u64,
}

fn default_stripe_base_url() -> String { "https://api.stripe.com".to_string() }
fn default_stripe_timeout() -> u64 { 3000 }

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SagaConfig {
    pub request_deadline_ms: u64,
    pub lease_ttl_ms: u64,
    pub currency: String,
    /// Age after which an unsettled hold or pending booking is reclaimed
    pub hold_grace_seconds: i64,
    pub outbox_batch_size: i64,
    pub outbox_interval_seconds: u64,
    pub outbox_claim_timeout_seconds: u64,
    pub reconcile_interval_seconds: u64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `INNKEEP__STRIPE__SECRET_KEY=sk_live_...`
            .add_source(config::Environment::with_prefix("INNKEEP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
