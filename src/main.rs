use std::error::Error;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use statsd_exporter::mapper::MetricMapper;
use statsd_exporter::{http, listener, udp_buffer, Exporter, Registry, Telemetry};

/// Receives StatsD-style metrics and exports them as Prometheus metrics.
#[derive(Debug, Parser)]
#[command(name = "statsd-exporter", version, about)]
struct Args {
    /// The address on which to expose the web interface and generated
    /// Prometheus metrics.
    #[arg(long = "web.listen-address", default_value = ":9102")]
    web_listen_address: String,

    /// Path under which to expose metrics.
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    metrics_path: String,

    /// The UDP address on which to receive statsd metric lines. "" disables it.
    #[arg(long = "statsd.listen-udp", default_value = ":9125")]
    statsd_listen_udp: String,

    /// The TCP address on which to receive statsd metric lines. "" disables it.
    #[arg(long = "statsd.listen-tcp", default_value = ":9125")]
    statsd_listen_tcp: String,

    /// Metric mapping configuration file name.
    #[arg(long = "statsd.mapping-config")]
    mapping_config: Option<PathBuf>,

    /// Size (in bytes) of the operating system's read buffer associated
    /// with the UDP connection. 0 keeps the OS default.
    #[arg(long = "statsd.read-buffer", default_value_t = 0)]
    read_buffer: usize,

    /// Maximum number of entries in the metric mapping cache. Entries are
    /// evicted least-recently-used once the limit is reached.
    #[arg(long = "statsd.cache-size", default_value_t = 1000)]
    cache_size: usize,

    /// The number of listener tasks receiving UDP traffic.
    #[arg(long = "udp-listener.threads", default_value_t = 4)]
    udp_listener_threads: usize,

    /// The number of concurrent UDP packet handlers.
    #[arg(long = "udp-listener.handlers", default_value_t = 10000)]
    udp_packet_handlers: usize,

    /// Number of worker tasks handling metric events.
    #[arg(long = "event-listener.threads", default_value_t = 1)]
    event_listener_threads: usize,

    /// Capacity of the events channel between listeners and workers.
    #[arg(long = "event-queue.size", default_value_t = 10240)]
    event_queue_size: usize,

    /// The path to dump the compiled mapping patterns as a Dot file.
    #[arg(long = "debug.dump-patterns")]
    dump_patterns: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error).
    #[arg(long = "log.level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(error) = run(args).await {
        error!(%error, "fatal error, exiting");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    if args.statsd_listen_udp.is_empty() && args.statsd_listen_tcp.is_empty() {
        return Err("at least one of --statsd.listen-udp and --statsd.listen-tcp must be set".into());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting StatsD -> Prometheus exporter");

    let registry = Arc::new(Registry::new());
    let telemetry = Arc::new(Telemetry::register(&registry)?);
    let mapper = Arc::new(MetricMapper::new(args.cache_size, telemetry.clone()));

    if let Some(path) = &args.mapping_config {
        mapper.load_file(path)?;
        info!(path = %path.display(), "loaded mapping config");

        if let Some(dump_path) = &args.dump_patterns {
            let mut file = std::fs::File::create(dump_path)?;
            mapper.dump_patterns(&mut file)?;
            info!(path = %dump_path.display(), "dumped mapping patterns");
        }
    }

    let (events_tx, events_rx) = flume::bounded(args.event_queue_size);
    let mut listener_tasks = Vec::new();

    if !args.statsd_listen_udp.is_empty() {
        let addr = parse_listen_addr(&args.statsd_listen_udp)?;
        let socket = listener::udp::bind(addr, args.read_buffer)?;
        info!(%addr, "accepting StatsD traffic over UDP");
        listener_tasks.extend(listener::udp::spawn(
            socket,
            args.udp_listener_threads,
            args.udp_packet_handlers,
            telemetry.clone(),
            events_tx.clone(),
        ));
    }

    if !args.statsd_listen_tcp.is_empty() {
        let addr = parse_listen_addr(&args.statsd_listen_tcp)?;
        let tcp = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "accepting StatsD traffic over TCP");
        listener_tasks.push(listener::tcp::spawn(tcp, telemetry.clone(), events_tx.clone()));
    }

    let exporter = Arc::new(Exporter::new(registry.clone(), mapper.clone(), telemetry.clone()));
    let workers: Vec<_> = (0..args.event_listener_threads.max(1))
        .map(|_| tokio::spawn(exporter.clone().run_worker(events_rx.clone())))
        .collect();
    let sweeper = tokio::spawn(exporter.clone().run_sweeper());

    let web_addr = parse_listen_addr(&args.web_listen_address)?;
    let web_listener = tokio::net::TcpListener::bind(web_addr).await?;
    info!(%web_addr, path = %args.metrics_path, "accepting Prometheus scrapes");
    let scrape_server =
        tokio::spawn(http::serve(web_listener, registry.clone(), args.metrics_path.clone()));

    let config_watcher = args.mapping_config.clone().map(|path| {
        tokio::spawn(watch_config(path, mapper.clone(), telemetry.clone()))
    });
    let buffer_watcher = tokio::spawn(udp_buffer::watch(telemetry.clone()));

    // The listeners hold the remaining senders; dropping ours lets the
    // workers observe channel closure once the listeners stop.
    drop(events_tx);

    wait_for_shutdown().await;
    info!("shutting down");

    for task in listener_tasks {
        task.abort();
    }
    if let Some(watcher) = config_watcher {
        watcher.abort();
    }
    buffer_watcher.abort();
    scrape_server.abort();

    // Give the workers a moment to drain what is already queued.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    for worker in workers {
        if tokio::time::timeout_at(deadline, worker).await.is_err() {
            warn!("timed out waiting for event workers to drain");
            break;
        }
    }
    sweeper.abort();

    Ok(())
}

// Accepts Go-style listen addresses where the host may be omitted
// (":9125" means "0.0.0.0:9125").
fn parse_listen_addr(addr: &str) -> Result<SocketAddr, Box<dyn Error>> {
    let full = if addr.starts_with(':') { format!("0.0.0.0{addr}") } else { addr.to_string() };
    full.to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("listen address {addr:?} did not resolve").into())
}

// Polls the mapping file's modification time and reloads on change.
async fn watch_config(path: PathBuf, mapper: Arc<MetricMapper>, telemetry: Arc<Telemetry>) {
    let mut last_mtime = mtime(&path);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let current = mtime(&path);
        if current.is_none() || current == last_mtime {
            continue;
        }
        last_mtime = current;

        info!(path = %path.display(), "mapping config changed, attempting reload");
        match mapper.load_file(&path) {
            Ok(true) => {
                info!("config reloaded successfully");
                telemetry.config_loads.success.inc();
            }
            Ok(false) => {
                info!("config reload skipped, content unchanged");
                telemetry.config_loads.skipped.inc();
            }
            Err(error) => {
                error!(%error, "error reloading config, keeping previous mappings");
                telemetry.config_loads.failure.inc();
            }
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
