use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::Engine;

/// Periodically removes session directories abandoned by a crashed process
pub async fn janitor(
    engine: Arc<Engine>,
    max_age: Duration,
    period: Duration,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    log::info!(
        "Janitor started, sweeping {} every {period:?}",
        engine.sessions().root().display()
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Janitor received shutdown signal, stopping");
                break;
            }

            _ = ticker.tick() => {
                let engine = engine.clone();
                let swept = tokio::task::spawn_blocking(move || {
                    engine.sessions().sweep_stale(max_age)
                })
                .await?;

                match swept {
                    Ok(0) => {}
                    Ok(n) => log::debug!("Janitor removed {n} stale session(s)"),
                    Err(e) => log::error!("Janitor failed to sweep sessions: {e}"),
                }
            }
        }
    }

    log::info!("Janitor has shut down gracefully");
    Ok(())
}
