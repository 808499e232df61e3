use std::future::Future;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::dispatch::InFlight;

/// Caller-supplied liveness probe for predicate-driven timeouts, evaluated
/// once per timeout interval. `Ok(true)` re-arms the next tick, `Ok(false)`
/// stops waiting, and an error is logged and treated as "stop waiting".
pub type TimeoutPredicate = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<bool, anyhow::Error>> + Send>> + Send + Sync,
>;

pub(crate) enum TimeoutPolicy {
    /// The command never times out.
    Never,
    /// A single timer covering the whole run.
    Fixed(Duration),
    /// The budget applies to the gap since the last progress event, not to
    /// total runtime, so a long network operation stays alive as long as
    /// the worker keeps reporting progress.
    ProgressDriven(Duration),
    /// The caller assesses liveness itself.
    Predicate {
        tick: Duration,
        predicate: TimeoutPredicate,
    },
}

/// Resolves when the policy decides the command has timed out; pends
/// forever for `Never`. Raced against the transport reply with `select!`.
pub(crate) async fn wait_for_timeout(policy: &TimeoutPolicy, in_flight: &InFlight) {
    match policy {
        TimeoutPolicy::Never => pending().await,
        TimeoutPolicy::Fixed(budget) => sleep(*budget).await,
        TimeoutPolicy::ProgressDriven(budget) => loop {
            let last = *in_flight.last_progress.lock().await;
            let elapsed = last.elapsed();
            if elapsed >= *budget {
                return;
            }
            sleep(*budget - elapsed).await;
        },
        TimeoutPolicy::Predicate { tick, predicate } => loop {
            sleep(*tick).await;
            match predicate().await {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    warn!(error = %err, "timeout predicate failed; treating the command as expired");
                    return;
                }
            }
        },
    }
}
