use std::fmt::Display;
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;

use flowmeter::new_counter;
use flowmeter::AdaptiveOptions;
use flowmeter::AdaptiveSharding;
use flowmeter::AdjusterOptions;
use flowmeter::GracefulShutdown;
use flowmeter::MetricsSampler;
use flowmeter::RateLimiter;
use flowmeter::RuntimeProbe;

use flowmeter_server::config::AppConfig;
use flowmeter_server::observability;
use flowmeter_server::routes::build_router;
use flowmeter_server::AppState;
use flowmeter_server::TokioProbe;

#[derive(Parser, Debug)]
#[command(version, about = "QPS measurement and admission-control service")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override, taking precedence over config and environment
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).or_exit("failed to load config");
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let _log_guard =
        observability::init_tracing(&config.logger).or_exit("failed to initialize logging");
    let metrics_handle =
        observability::install_metrics_recorder().or_exit("failed to install metrics recorder");

    let counter = new_counter(config.counter_kind(), config.counter_config())
        .or_exit("failed to build counter");
    let probe: Arc<dyn RuntimeProbe> =
        Arc::new(TokioProbe::new(tokio::runtime::Handle::current()));

    let limiter = Arc::new(RateLimiter::new(
        NonZeroU64::new(config.limiter.rate).unwrap_or(NonZeroU64::MIN),
        NonZeroU64::new(config.limiter.burst).unwrap_or(NonZeroU64::MIN),
    ));
    if !config.limiter.enabled {
        limiter.set_enabled(false);
    }
    if config.limiter.adaptive {
        limiter.spawn_adjuster(Arc::clone(&probe), AdjusterOptions::default());
    }

    let adaptive = AdaptiveSharding::new(
        Arc::clone(&counter),
        Arc::clone(&probe),
        AdaptiveOptions::default(),
    );
    let lifecycle = Arc::new(GracefulShutdown::new(
        config.shutdown.timeout,
        config.shutdown.max_wait,
    ));
    let sampler = MetricsSampler::new(
        Arc::clone(&counter),
        Arc::clone(&probe),
        config.metrics.interval,
    );
    if config.metrics.enabled {
        sampler.start();
    }

    let state = AppState {
        counter: Arc::clone(&counter),
        limiter: Arc::clone(&limiter),
        lifecycle: Arc::clone(&lifecycle),
    };
    // The request timeout bounds the whole exchange, so it budgets for
    // both configured halves.
    let request_timeout = config.server.read_timeout + config.server.write_timeout;
    let router = build_router(
        state,
        metrics_handle,
        &config.metrics.endpoint,
        request_timeout,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .or_exit("failed to bind listener");
    tracing::info!(%addr, counter = ?config.counter.counter_type, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .or_exit("server error");

    // Background workers first; the drain runs last so in-flight requests
    // keep a working counter until they finish.
    sampler.stop();
    limiter.stop();
    adaptive.stop();
    counter.stop();
    match lifecycle.shutdown() {
        Ok(()) => tracing::info!(status = lifecycle.status().as_str(), "shutdown complete"),
        Err(err) => tracing::error!(
            %err,
            abandoned = lifecycle.active_requests(),
            "shutdown forced"
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C signal"),
        _ = terminate => tracing::info!("received SIGTERM signal"),
    }
}

/// Initialization-only escape hatch: print the error and exit. After
/// startup all errors are handled gracefully.
trait OrExit<T> {
    fn or_exit(self, msg: &str) -> T;
}

impl<T, E: Display> OrExit<T> for Result<T, E> {
    fn or_exit(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                eprintln!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}
