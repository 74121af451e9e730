use anyhow::Context;
use innkeep_api::{app, state::{AppState, AuthConfig}, worker};
use innkeep_booking::{BookingOrchestrator, OutboxDispatcher, Reconciler, SagaSettings};
use innkeep_store::{app_config::Config, DbClient, EventProducer, PostgresBookingRepository, RedisClient, StripeGateway};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "innkeep_api=debug,innkeep_booking=debug,innkeep_store=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Innkeep API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let repo = Arc::new(PostgresBookingRepository::new(
        db.pool.clone(),
        Duration::from_secs(config.saga.outbox_claim_timeout_seconds),
    ));

    // Redis
    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("Failed to open Redis client")?;
    redis.ping().await.context("Failed to reach Redis")?;
    let redis = Arc::new(redis);

    // Kafka
    let kafka = Arc::new(EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?);

    // Stripe
    let gateway = Arc::new(StripeGateway::new(&config.stripe).context("Failed to build Stripe client")?);

    let dispatcher = OutboxDispatcher::new(repo.clone(), kafka, config.saga.outbox_batch_size);
    let orchestrator = BookingOrchestrator::new(
        repo.clone(),
        redis.clone(),
        gateway.clone(),
        dispatcher.clone(),
        SagaSettings {
            currency: config.saga.currency.clone(),
            request_deadline: Duration::from_millis(config.saga.request_deadline_ms),
            lease_ttl: Duration::from_millis(config.saga.lease_ttl_ms),
            booking_topic: config.kafka.booking_topic.clone(),
            settlement_topic: config.kafka.settlement_topic.clone(),
            event_key: config.kafka.event_key.clone(),
        },
    );
    let reconciler = Reconciler::new(
        repo,
        redis,
        gateway,
        chrono::Duration::seconds(config.saga.hold_grace_seconds),
    );

    // Background workers
    tokio::spawn(worker::start_outbox_worker(
        dispatcher,
        Duration::from_secs(config.saga.outbox_interval_seconds),
    ));
    tokio::spawn(worker::start_reconciliation_worker(
        reconciler,
        Duration::from_secs(config.saga.reconcile_interval_seconds),
    ));

    let app_state = AppState {
        orchestrator: Arc::new(orchestrator),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
        pub_key: config.stripe.publishable_key.clone(),
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind listener")?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
