//! IronPay 主入口

use std::sync::Arc;

use anyhow::{Context, Result};
use ironpay::{
    api,
    app_state::AppState,
    config::Config,
    domain::{MasterSeed, SeedVault},
    infrastructure::{db, logging},
    repository::{InMemoryPaymentStore, PaymentStore, PgPaymentStore},
    service::{ChainSource, EsploraChainSource},
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量
    dotenvy::dotenv().ok();

    // 2. 加载配置（IRONPAY_CONFIG 指向 TOML 文件时文件优先）
    let config_path = std::env::var("IRONPAY_CONFIG").ok();
    let config = Config::from_env_and_file(config_path.as_deref())
        .context("Failed to load configuration")?;

    // 3. 初始化日志
    logging::init_logging(&config.logging)?;
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        network = %config.payment.network,
        address_kind = config.payment.address_kind.as_str(),
        "Starting IronPay"
    );

    // 4. 账本存储
    let (store, pool) = if config.database.url.is_some() {
        let pool = db::init_pool(&config.database)
            .await
            .context("Failed to connect to database")?;
        tracing::info!("Database connected");

        if config.database.run_migrations {
            db::run_migrations(&pool)
                .await
                .context("Database migrations failed")?;
            tracing::info!("Database migrations completed");
        } else {
            tracing::info!("Database migrations skipped");
        }
        let store: Arc<dyn PaymentStore> = Arc::new(PgPaymentStore::new(pool.clone()));
        (store, Some(pool))
    } else {
        tracing::warn!("No database configured, using in-memory ledger (data is lost on restart)");
        let store: Arc<dyn PaymentStore> = Arc::new(InMemoryPaymentStore::new());
        (store, None)
    };

    // 5. 主种子
    let seed = match &config.vault.mnemonic {
        Some(phrase) => {
            let passphrase = config
                .vault
                .passphrase
                .as_ref()
                .map(|p| p.as_str())
                .unwrap_or("");
            MasterSeed::from_mnemonic(phrase, passphrase).context("Failed to load master seed")?
        }
        None => {
            // validate() 已保证只有测试网允许临时种子
            let (seed, _phrase) = MasterSeed::generate(config.vault.entropy_bits)
                .context("Failed to generate ephemeral seed")?;
            tracing::warn!("Using an ephemeral master seed; addresses cannot be recovered after restart");
            seed
        }
    };
    let vault = Arc::new(SeedVault::new(seed));

    // 6. 链上数据源与通知
    let source: Arc<dyn ChainSource> = Arc::new(
        EsploraChainSource::new(
            config.chain.esplora_url.clone(),
            config.chain.query_timeout(),
            config.chain.max_retries,
            config.chain.retry_delay(),
        )
        .context("Failed to build chain source")?,
    );
    let notifier = AppState::build_notifier(&config)?;

    let config = Arc::new(config);
    let state = Arc::new(AppState::new(
        config.clone(),
        vault,
        store,
        source,
        notifier,
        pool,
    ));

    // 7. 后台轮询
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let observer = state.observer.clone();
    let observer_task = tokio::spawn(async move {
        observer.run(shutdown_rx).await;
    });

    // 8. HTTP 服务
    let app = api::routes(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    tracing::info!(bind_addr = %config.server.bind_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 9. 停止轮询
    let _ = shutdown_tx.send(true);
    if let Err(e) = observer_task.await {
        tracing::error!(error = %e, "Chain observer task failed");
    }
    tracing::info!("IronPay stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
