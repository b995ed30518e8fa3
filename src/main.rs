use anyhow::{Context, Result};
use dotenvy::dotenv;
use mirrorx::accounts::load_accounts;
use mirrorx::client::MexcClient;
use mirrorx::config::Config;
use mirrorx::models::FollowerId;
use mirrorx::notify::{Notifier, TelegramNotifier, TracingNotifier};
use mirrorx::{Engine, Follower, Leader};
use std::{env, sync::Arc};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let cfg = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .context("invalid LOG_LEVEL")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Ok(cwd) = env::current_dir() {
        info!("cwd: {}", cwd.display());
    }
    info!("ORDER_API_BASE={} QUERY_API_BASE={}", cfg.order_api_base, cfg.query_api_base);

    let accounts = load_accounts(&cfg.accounts_dir)
        .with_context(|| format!("loading accounts from {}", cfg.accounts_dir.display()))?;
    info!("Loaded {} follower accounts", accounts.followers.len());

    let endpoints = cfg.endpoints();
    let timeout = cfg.request_timeout();

    let leader_client = MexcClient::new(endpoints.clone(), &accounts.leader.credentials, timeout)
        .context("leader client setup failed")?;
    let leader = Leader {
        name: accounts.leader.name.clone(),
        client: Arc::new(leader_client),
    };

    let mut followers = Vec::with_capacity(accounts.followers.len());
    for (i, spec) in accounts.followers.iter().enumerate() {
        let client = MexcClient::new(endpoints.clone(), &spec.credentials, timeout)
            .with_context(|| format!("client setup failed for follower {}", spec.name))?;
        followers.push(Follower {
            id: FollowerId(i),
            name: spec.name.clone(),
            client: Arc::new(client),
            multiplier: spec.multiplier,
        });
    }

    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(TracingNotifier)];
    if let (Some(token), Some(chat)) = (&cfg.telegram_bot_token, &cfg.telegram_chat_id) {
        let telegram = TelegramNotifier::new(token.clone(), chat.clone())
            .context("telegram notifier setup failed")?;
        notifiers.push(Arc::new(telegram));
        info!("Telegram notifications enabled");
    }

    let mut engine = Engine::new(cfg.engine_settings(), leader, followers, notifiers);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
        let _ = stop_tx.send(());
    });

    engine
        .run_until(async {
            let _ = stop_rx.await;
        })
        .await;

    Ok(())
}
