//! Consumes the typed event channels and turns them into log lines at
//! the right severity.

use storeplane_breaker::BreakerEvent;
use storeplane_db::{DbEvent, FailoverCause};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub async fn run(
    mut db_events: mpsc::Receiver<DbEvent>,
    mut breaker_events: mpsc::Receiver<BreakerEvent>,
) {
    loop {
        tokio::select! {
            event = db_events.recv() => match event {
                Some(event) => log_db_event(event),
                None => break,
            },
            event = breaker_events.recv() => match event {
                Some(event) => log_breaker_event(event),
                None => break,
            },
        }
    }
}

fn log_db_event(event: DbEvent) {
    match event {
        DbEvent::Failover { cause, target } => match cause {
            FailoverCause::Recovered => info!(target_node = %target, "database primary recovered"),
            FailoverCause::PrimaryFailure => {
                warn!(target_node = %target, "database failover promoted a replica")
            }
            FailoverCause::AllUnhealthy => error!("database failover found no healthy node"),
        },
        DbEvent::HealthChange { component, healthy } => {
            if healthy {
                info!(%component, "database node healthy");
            } else {
                warn!(%component, "database node unhealthy");
            }
        }
    }
}

fn log_breaker_event(event: BreakerEvent) {
    match event {
        BreakerEvent::Opened { dependency } => warn!(%dependency, "circuit opened"),
        BreakerEvent::HalfOpened { dependency } => info!(%dependency, "circuit half-open"),
        BreakerEvent::Closed { dependency } => info!(%dependency, "circuit closed"),
        BreakerEvent::SecurityFailClosed { dependency } => {
            error!(%dependency, "security dependency failing closed, denying requests")
        }
    }
}
