use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;

use sessionbridge::config::{ConfigStore, GatewayConfig};
use sessionbridge::server::config_routes;
use sessionbridge::session::SessionManager;
use sessionbridge::tokens::HeuristicTokenCounter;
use sessionbridge::upstream::UpstreamClient;
use sessionbridge::util;

/// OpenAI-compatible gateway over a rotating session-credential pool.
#[derive(Debug, Parser)]
#[command(name = "sessionbridge", version)]
struct Args {
    /// Path to the config / pool-state document.
    #[arg(long, env = "SESSIONBRIDGE_CONFIG", default_value = "config.yaml")]
    config: String,

    /// Bind address override, `ip:port`.
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    util::init_tracing();
    let args = Args::parse();

    // Pools supplied purely through the environment leave the config file
    // untouched.
    let env_pool =
        std::env::var("COOKIE").is_ok() || std::env::var("COOKIE_ARRAY").is_ok();
    let store = if env_pool {
        ConfigStore::readonly()
    } else {
        ConfigStore::at(&args.config)
    };

    let (mut config, existed) = store.load()?;
    if !existed && !env_pool {
        store.save(&GatewayConfig::default())?;
        tracing::warn!(
            path = %args.config,
            "config file created; add session credentials and restart"
        );
        return Ok(());
    }
    config.apply_env_overrides();

    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.ip, config.port));

    let session = SessionManager::new(
        config,
        store,
        UpstreamClient::new(util::build_http_client_from_env()),
        Arc::new(HeuristicTokenCounter::default()),
    )?;
    session.start();

    {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down; cleaning up the live conversation");
                session.shutdown_cleanup().await;
                std::process::exit(0);
            }
        });
    }

    tracing::info!(%bind, "listening on http://{bind}/v1");
    let data = web::Data::from(Arc::clone(&session));
    HttpServer::new(move || {
        App::new()
            .wrap(util::cors_config_from_env())
            .app_data(data.clone())
            .configure(config_routes)
    })
    .bind(&bind)?
    .run()
    .await?;

    session.shutdown_cleanup().await;
    Ok(())
}
