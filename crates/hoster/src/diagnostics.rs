//! Diagnostics endpoint: process variables and runtime profile snapshots.
//!
//! The endpoint is a bare HTTP listener with no business routes:
//!
//! - `GET /debug/vars` - JSON with the command line, uptime, a tokio runtime
//!   snapshot and every counter and gauge recorded through [`metrics`].
//! - `GET /debug/pprof` - index of the available profiles.
//! - `GET /debug/pprof/cmdline` - the command line, NUL separated.
//! - `GET /debug/pprof/runtime` - tokio runtime snapshot as text.
//! - `GET /debug/pprof/profile?seconds=N` - CPU profile in pprof protobuf
//!   format (unix only).
//!
//! Counters are recorded with the `metrics` macros. [`install_recorder`]
//! registers a process-global recorder that keeps them for `/debug/vars`. A
//! process that installs its own recorder first keeps its own, and the
//! `counters` map stays empty.

use crate::error::{Endpoint, Error, Result};
#[cfg(unix)]
use axum::extract::Query;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get};
use http::{StatusCode, header};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};
#[cfg(unix)]
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::{Arc, LazyLock, OnceLock};
#[cfg(unix)]
use std::time::Duration;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
type BoxError = Box<dyn std::error::Error + Send + Sync>;

static STARTED_AT: LazyLock<Instant> = LazyLock::new(Instant::now);
static REGISTRY: LazyLock<Registry<Key, AtomicStorage>> = LazyLock::new(Registry::atomic);
static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Keeps counters and gauges in [`REGISTRY`]. Histograms are dropped.
struct VarsRecorder;

impl Recorder for VarsRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        REGISTRY.get_or_create_counter(key, |c| Counter::from_arc(Arc::clone(c)))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        REGISTRY.get_or_create_gauge(key, |g| Gauge::from_arc(Arc::clone(g)))
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

/// Installs the recorder behind `/debug/vars` as the global `metrics`
/// recorder. Idempotent. Returns `false` when another recorder was
/// installed first.
pub fn install_recorder() -> bool {
    *INSTALLED.get_or_init(|| {
        let installed = metrics::set_global_recorder(VarsRecorder).is_ok();
        #[cfg(feature = "tracing")]
        {
            if !installed {
                tracing::warn!("A metrics recorder is already installed, /debug/vars has no counters");
            }
        }
        installed
    })
}

/// Sum of the counter `name` across all of its label sets, as seen by the
/// `/debug/vars` recorder.
pub fn counter_total(name: &str) -> u64 {
    let mut total = 0;
    REGISTRY.visit_counters(|key, counter| {
        if key.name() == name {
            total += counter.load(Ordering::Relaxed);
        }
    });
    total
}

/// Pins the process start time used for `uptime_seconds` and installs the
/// recorder.
pub(crate) fn mark_started() {
    LazyLock::force(&STARTED_AT);
    install_recorder();
}

fn key_label(key: &Key) -> String {
    let mut label = key.name().to_string();
    let mut labels = key.labels().peekable();
    if labels.peek().is_some() {
        label.push('{');
        for (i, l) in labels.enumerate() {
            if i > 0 {
                label.push(',');
            }
            let _ = write!(label, "{}={:?}", l.key(), l.value());
        }
        label.push('}');
    }
    label
}

#[derive(Debug, Serialize)]
struct Vars {
    cmdline: Vec<String>,
    uptime_seconds: u64,
    runtime: Option<RuntimeSnapshot>,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
struct RuntimeSnapshot {
    workers: usize,
    alive_tasks: usize,
    global_queue_depth: usize,
}

impl RuntimeSnapshot {
    fn current() -> Option<Self> {
        let metrics = tokio::runtime::Handle::try_current().ok()?.metrics();
        Some(Self {
            workers: metrics.num_workers(),
            alive_tasks: metrics.num_alive_tasks(),
            global_queue_depth: metrics.global_queue_depth(),
        })
    }
}

fn vars() -> Vars {
    let mut counters = BTreeMap::new();
    REGISTRY.visit_counters(|key, counter| {
        counters.insert(key_label(key), counter.load(Ordering::Relaxed));
    });
    let mut gauges = BTreeMap::new();
    REGISTRY.visit_gauges(|key, gauge| {
        gauges.insert(key_label(key), f64::from_bits(gauge.load(Ordering::Relaxed)));
    });
    Vars {
        cmdline: std::env::args().collect(),
        uptime_seconds: STARTED_AT.elapsed().as_secs(),
        runtime: RuntimeSnapshot::current(),
        counters,
        gauges,
    }
}

async fn vars_handler() -> Json<Vars> {
    Json(vars())
}

async fn index_handler() -> &'static str {
    "/debug/pprof/\n\
     \n\
     profiles:\n\
     cmdline  the command line invoking this process\n\
     runtime  tokio runtime workers, alive tasks and queue depth\n\
     profile  CPU profile in pprof format, ?seconds=N (default 30)\n\
     \n\
     see also /debug/vars\n"
}

async fn cmdline_handler() -> String {
    std::env::args().collect::<Vec<_>>().join("\0")
}

async fn runtime_handler() -> String {
    match RuntimeSnapshot::current() {
        Some(snapshot) => format!(
            "workers: {}\nalive_tasks: {}\nglobal_queue_depth: {}\nuptime_seconds: {}\n",
            snapshot.workers,
            snapshot.alive_tasks,
            snapshot.global_queue_depth,
            STARTED_AT.elapsed().as_secs()
        ),
        None => "no tokio runtime\n".to_string(),
    }
}

#[cfg(unix)]
const DEFAULT_PROFILE_SECONDS: u64 = 30;
#[cfg(unix)]
const MAX_PROFILE_SECONDS: u64 = 300;
#[cfg(unix)]
const PROFILE_FREQUENCY_HZ: i32 = 100;

#[cfg(unix)]
#[derive(Debug, Deserialize)]
struct ProfileParams {
    seconds: Option<u64>,
}

/// Samples the whole process for `seconds` and answers with the encoded
/// `pprof` profile. Only one profile can run at a time.
#[cfg(unix)]
async fn profile_handler(Query(params): Query<ProfileParams>) -> Response {
    let seconds = params.seconds.unwrap_or(DEFAULT_PROFILE_SECONDS);
    if seconds == 0 || seconds > MAX_PROFILE_SECONDS {
        return (
            StatusCode::BAD_REQUEST,
            format!("seconds must be between 1 and {MAX_PROFILE_SECONDS}\n"),
        )
            .into_response();
    }

    let profiled =
        tokio::task::spawn_blocking(move || cpu_profile(Duration::from_secs(seconds))).await;
    match profiled {
        Ok(Ok(body)) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"profile\""),
            ],
            body,
        )
            .into_response(),
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("could not profile: {e}\n"),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("profiler task failed: {e}\n"),
        )
            .into_response(),
    }
}

#[cfg(not(unix))]
async fn profile_handler() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        "CPU profiles are only available on unix\n",
    )
        .into_response()
}

#[cfg(unix)]
fn cpu_profile(duration: Duration) -> std::result::Result<Vec<u8>, BoxError> {
    use pprof::protos::Message;

    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(PROFILE_FREQUENCY_HZ)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()?;
    std::thread::sleep(duration);
    let profile = guard.report().build()?.pprof()?;

    let mut body = Vec::new();
    profile.encode(&mut body)?;
    Ok(body)
}

/// Routes served by the diagnostics endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/debug/vars", get(vars_handler))
        .route("/debug/pprof", get(index_handler))
        .route("/debug/pprof/", get(index_handler))
        .route("/debug/pprof/cmdline", get(cmdline_handler))
        .route("/debug/pprof/runtime", get(runtime_handler))
        .route("/debug/pprof/profile", get(profile_handler))
}

/// Serves the diagnostics routes on `address` until `shutdown` fires.
///
/// # Errors
///
/// - [`Error::InvalidConfiguration`] if `address` is empty.
/// - [`Error::BindFailure`] if the socket cannot be bound.
/// - [`Error::TransportTerminated`] if the server stops on its own.
pub async fn launch_diagnostics(address: &str, shutdown: CancellationToken) -> Result<()> {
    let address = crate::config::require(crate::config::non_empty(Some(address)), "diagnostics address")?;
    install_recorder();

    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| Error::BindFailure {
            endpoint: Endpoint::Diagnostics,
            address: address.to_string(),
            source,
        })?;

    #[cfg(feature = "tracing")]
    tracing::info!("Serving diagnostics on {}", address);

    let stopped = shutdown.clone();
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { stopped.cancelled().await })
        .await
        .map_err(|e| Error::terminated(Endpoint::Diagnostics, e))?;

    if shutdown.is_cancelled() {
        Ok(())
    } else {
        Err(Error::terminated(
            Endpoint::Diagnostics,
            "listener closed unexpectedly",
        ))
    }
}
