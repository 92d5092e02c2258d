//! Shared helpers for the `codomyrmex` integration tests.

pub mod builders;
pub mod fake_actions;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use codomyrmex::logging::LOG_ENV_VAR;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Upper bound for any single awaited operation in a test.
pub const TEST_DEADLINE: Duration = Duration::from_secs(10);

/// Install a test-captured subscriber once per test binary.
///
/// The filter comes from `CODOMYRMEX_LOG` (same variable as the library),
/// e.g. `CODOMYRMEX_LOG=codomyrmex::exec=debug`, defaulting to `info`.
/// Output only shows for failing tests unless run with `--nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = std::env::var(LOG_ENV_VAR)
            .ok()
            .and_then(|spec| EnvFilter::try_new(spec).ok())
            .unwrap_or_else(|| EnvFilter::new("info"));

        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `fut`, panicking if it outlives [`TEST_DEADLINE`].
pub async fn with_timeout<F, T>(fut: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(TEST_DEADLINE, fut).await {
        Ok(value) => value,
        Err(_) => panic!("test operation exceeded {TEST_DEADLINE:?}"),
    }
}

/// Poll `cond` every few milliseconds until it holds or about a second
/// passes. Returns the final evaluation.
///
/// For state that settles asynchronously, such as events forwarded from
/// workers or worker slots freed after an abort.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
