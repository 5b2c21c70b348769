use anyhow::Context;
use clap::Parser;
use gitserver_core::metrics::{
    EventSink, NoEvents, PrometheusMetrics, RepoTracker, TracingEvents,
};
use gitserver_core::Server;
use gitserver::http::HttpState;
use prometheus_client::registry::Registry;
use tracing_futures::Instrument;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

async fn shutdown_signal() {
    // Wait for the CTRL+C signal
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install CTRL+C signal handler: {}", e);
        futures::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// Returns `true` when an OTLP pipeline was installed.
fn init_trace() -> anyhow::Result<bool> {
    use opentelemetry::sdk::propagation::TraceContextPropagator;
    use opentelemetry::sdk::{trace, Resource};
    use opentelemetry::global;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
    use tracing_subscriber::Layer;

    // Lets traces of callers that propagate their context continue here
    global::set_text_map_propagator(TraceContextPropagator::new());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(false)
        .with_writer(io::stderr);

    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::EnvFilter::from_default_env(),
        _ => tracing_subscriber::EnvFilter::new("gitserver=trace,gitserver_core=trace"),
    };

    let service_name =
        std::env::var("GITSERVER_SERVICE_NAME").unwrap_or("gitserver".to_owned());

    if let Ok(endpoint) = std::env::var("GITSERVER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                trace::config().with_resource(Resource::new(vec![
                    SERVICE_NAME.string(service_name),
                ])),
            )
            .install_batch(opentelemetry::runtime::Tokio)
            .context("failed to install OTLP pipeline")?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        let subscriber = filter
            .and_then(fmt_layer)
            .and_then(telemetry_layer)
            .with_subscriber(tracing_subscriber::Registry::default());
        tracing::subscriber::set_global_default(subscriber)
            .context("can't set_global_default")?;

        Ok(true)
    } else {
        let subscriber = filter
            .and_then(fmt_layer)
            .with_subscriber(tracing_subscriber::Registry::default());
        tracing::subscriber::set_global_default(subscriber)
            .context("can't set_global_default")?;

        Ok(false)
    }
}

async fn run_server(args: gitserver::cli::Args) -> anyhow::Result<i32> {
    let mut config = args.server_config();
    if !config.repos_dir.is_absolute() {
        config.repos_dir = std::env::current_dir()?.join(&config.repos_dir);
    }
    std::fs::create_dir_all(&config.repos_dir).with_context(|| {
        format!("failed to create {}", config.repos_dir.display())
    })?;

    let mut registry = Registry::default();
    let metrics = Arc::new(PrometheusMetrics::new(&mut registry));
    let tracker = RepoTracker::new(&args.track_repo)
        .map_err(|e| anyhow::anyhow!(e.0))
        .context("invalid --track-repo")?;
    let events: Arc<dyn EventSink> = if args.exec_events {
        Arc::new(TracingEvents)
    } else {
        Arc::new(NoEvents)
    };

    let server = Arc::new(
        Server::new(config)
            .with_metrics(metrics)
            .with_events(events)
            .with_tracker(tracker),
    );
    tracing::info!(?server, "starting");

    let (requests, dispatcher) = server.serve();
    let state = Arc::new(HttpState { requests, registry });

    let addr: SocketAddr = format!("[::]:{}", args.port).parse()?;
    let listener = std::net::TcpListener::bind(addr)?;

    eprintln!("Now listening on {}", addr);

    gitserver::http::serve(listener, state, shutdown_signal())
        .instrument(tracing::info_span!("http"))
        .await
        .map_err(|e| anyhow::anyhow!(e.0))
        .context("http server exited")?;

    // The HTTP state held the last request sender.
    dispatcher.await?;

    Ok(0)
}

fn main() {
    let args = gitserver::cli::Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("gitserver: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(async {
        let otlp = match init_trace() {
            Ok(otlp) => otlp,
            Err(e) => {
                eprintln!("gitserver: {:#}", e);
                return 1;
            }
        };

        let exit_code = match run_server(args).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("{:#}", e);
                1
            }
        };

        if otlp {
            opentelemetry::global::shutdown_tracer_provider();
        }

        exit_code
    });

    std::process::exit(exit_code);
}
