use std::{sync::Arc, time::Duration};

use clap::Parser;
use vigil::{
    AppState, compiler, directory,
    http::router,
    observability,
    policy::PolicyStore,
    session::RedisSessionStore,
};

#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Identity-aware forward-auth control plane")]
struct Args {
    /// Path to the policy/config YAML file.
    #[arg(short, long, default_value = "vigil.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    observability::init_tracing();
    if let Err(e) = observability::init_metrics() {
        tracing::warn!(error = %e, "failed to initialize metrics");
    }

    let policy = match PolicyStore::load(&args.config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", args.config);
            std::process::exit(1);
        }
    };

    let startup = policy.snapshot();
    let config = startup.config.clone();
    tracing::info!(
        config_file = %args.config,
        routes = startup.routes.len(),
        "starting vigil",
    );

    let sessions = match RedisSessionStore::connect(&config.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Failed to connect to redis at {}: {e}", config.redis_url);
            std::process::exit(1);
        }
    };

    let directory = match directory::from_config(&config).await {
        Ok(directory) => directory,
        Err(e) => {
            eprintln!("Failed to initialize directory provider: {e}");
            std::process::exit(1);
        }
    };

    directory::spawn_update_task(
        directory.clone(),
        Duration::from_secs(config.idp_refresh_directory_interval_seconds),
        config.refresh_idp_at_start,
    );

    let state = AppState::new(policy.clone(), directory, sessions);

    // First compile-and-push, then recompile on every SIGHUP reload.
    push_compiled(&startup, &config, &state.http).await;
    spawn_reload_task(policy.clone(), state.http.clone());

    let app = router(state);
    let bind_addr = format!("0.0.0.0:{}", config.auth_listen_port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {bind_addr}: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bind_addr, "listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server exited");
        std::process::exit(1);
    }
}

async fn push_compiled(
    snapshot: &vigil::policy::Snapshot,
    config: &vigil::config::VigilConfig,
    http: &reqwest::Client,
) {
    let compiled = compiler::compile(snapshot);
    if let Err(e) = compiler::apply(
        &compiled,
        &config.caddy_admin_url,
        &config.caddy_config_path,
        http,
    )
    .await
    {
        tracing::error!(error = %e, "initial caddy config apply incomplete");
    }
}

/// SIGHUP reloads the policy file; a successful reload recompiles and pushes
/// the proxy config. A failed reload keeps the previous snapshot serving.
fn spawn_reload_task(policy: Arc<PolicyStore>, http: reqwest::Client) {
    tokio::spawn(async move {
        let mut hangups = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGHUP, hot reload disabled");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            match policy.reload() {
                Ok(snapshot) => {
                    tracing::info!(routes = snapshot.routes.len(), "policy reloaded");
                    let compiled = compiler::compile(&snapshot);
                    if let Err(e) = compiler::apply(
                        &compiled,
                        &snapshot.config.caddy_admin_url,
                        &snapshot.config.caddy_config_path,
                        &http,
                    )
                    .await
                    {
                        tracing::error!(error = %e, "caddy config apply incomplete after reload");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "policy reload failed, previous config stays active");
                }
            }
        }
    });
}
