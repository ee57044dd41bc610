//! Process-wide setup: the shared I/O runtime behind the blocking API, and the
//! log subscriber (logcat on Android, stderr elsewhere).

use std::sync::OnceLock;

use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Idempotent. Installs logging and starts the runtime.
pub fn init() -> std::io::Result<()> {
    init_logging();
    runtime().map(|_| ())
}

/// The shared runtime, started on first use.
pub fn runtime() -> std::io::Result<&'static Runtime> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("repeater-io")
        .enable_all()
        .build()?;
    // a racing caller may have won; the loser's runtime is dropped here
    Ok(RUNTIME.get_or_init(|| rt))
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| "repeater_core=info".into())
}

/// Install the global subscriber unless the host already set one.
pub fn init_logging() {
    #[cfg(target_os = "android")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        if let Ok(layer) = tracing_android::layer("repeater") {
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(layer)
                .try_init();
        }
    }
    #[cfg(not(target_os = "android"))]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .try_init();
    }
}
