use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::{body::Body, extract::MatchedPath, response::Response};
use axum_server::{bind, Handle as ServerHandle};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use http::{header, StatusCode};
use meowlnir::{
    config::Config, db::Pool, homeserver::http::ReqwestHomeserverApi, service::build_evaluators, services, Services, SERVICES,
};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let args = meowlnir::clap::parse();

    let config_path = args
        .config
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| Env::var("MEOWLNIR_CONFIG"))
        .unwrap_or_else(|| {
            eprintln!("No config file given. Pass --config <path> or set MEOWLNIR_CONFIG.");
            std::process::exit(1);
        });

    let raw_config = Figment::new().merge(Toml::file(&config_path).nested()).merge(Env::prefixed("MEOWLNIR_").global());

    let mut config: Config = match raw_config.extract() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.apply_registration_override() {
        eprintln!("Failed to apply appservice registration override: {e}");
        std::process::exit(1);
    }

    let filter_layer = EnvFilter::try_new(&config.log).unwrap_or_else(|e| {
        eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
        EnvFilter::try_new("warn").unwrap()
    });
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let subscriber = tracing_subscriber::Registry::default().with(filter_layer).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("setting the global tracing subscriber should only happen once");

    info!("{config}");

    if args.check_config {
        info!("Config is valid, exiting (--check-config).");
        return;
    }

    #[cfg(unix)]
    maximize_fd_limit().expect("should be able to increase the soft limit to the hard limit");

    if let Some(parent) = Path::new(&config.sqlite_path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!(error = %e, "failed to create the sqlite data directory");
            std::process::exit(2);
        }
    }

    info!("Opening database");
    let db: &'static Pool = match Pool::open(&config.sqlite_path, 4) {
        Ok(pool) => Box::leak(Box::new(pool)),
        Err(e) => {
            error!(error = %e, "The database couldn't be opened or migrated");
            std::process::exit(2);
        }
    };

    let homeserver: Arc<dyn meowlnir::homeserver::HomeserverApi> = match ReqwestHomeserverApi::new(
        config.homeserver_url.as_str().trim_end_matches('/').to_owned(),
        config.appservice.as_token.clone(),
        config.appservice.sender_localpart.clone(),
        config.server_name.as_str().to_owned(),
    ) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!(error = %e, "failed to build the homeserver HTTP client");
            std::process::exit(1);
        }
    };

    info!("Verifying the appservice handshake with the homeserver");
    if let Err(e) = homeserver.whoami().await {
        error!(error = %e, "appservice handshake rejected by the homeserver");
        std::process::exit(3);
    }

    let services: &'static Services = match Services::build(config, db, homeserver.clone()) {
        Ok(s) => Box::leak(Box::new(s)),
        Err(e) => {
            error!(error = %e, "failed to build services");
            std::process::exit(1);
        }
    };
    *SERVICES.write().unwrap() = Some(services);

    build_evaluators(services, homeserver).await;

    info!("Starting server");
    if let Err(e) = run_server().await {
        error!(error = %e, "server exited with an error");
        std::process::exit(1);
    }
}

async fn run_server() -> std::io::Result<()> {
    let config = &services().globals.config;
    let addr: SocketAddr = format!("{}:{}", config.address, config.port).parse().expect("address/port should form a valid socket address");

    let middlewares = ServiceBuilder::new()
        .sensitive_headers([header::AUTHORIZATION])
        .layer(axum::middleware::from_fn(reject_during_shutdown))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
            let path = request
                .extensions()
                .get::<MatchedPath>()
                .map_or_else(|| request.uri().path(), MatchedPath::as_str);
            tracing::info_span!("http_request", %path)
        }));

    let app = meowlnir::api::router().layer(middlewares).into_make_service();
    let handle = ServerHandle::new();

    tokio::spawn(shutdown_signal(handle.clone()));

    let server = bind(addr).handle(handle).serve(app);

    #[cfg(feature = "systemd")]
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    server.await
}

async fn reject_during_shutdown(req: http::Request<Body>, next: axum::middleware::Next) -> std::result::Result<Response, StatusCode> {
    if services().globals.is_shutting_down() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(next.run(req).await)
}

async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;
    tokio::select! {
        () = ctrl_c => { sig = "Ctrl+C"; },
        () = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {sig}, shutting down...");
    services().globals.begin_shutdown();
    handle.graceful_shutdown(Some(Duration::from_secs(30)));

    #[cfg(feature = "systemd")]
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
}

#[cfg(unix)]
#[tracing::instrument(err)]
fn maximize_fd_limit() -> std::result::Result<(), nix::errno::Errno> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let res = Resource::RLIMIT_NOFILE;
    let (soft_limit, hard_limit) = getrlimit(res)?;
    tracing::debug!("Current nofile soft limit: {soft_limit}");
    setrlimit(res, hard_limit, hard_limit)?;
    tracing::debug!("Increased nofile soft limit to {hard_limit}");
    Ok(())
}
