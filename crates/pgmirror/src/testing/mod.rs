//! Testing infrastructure shared by unit, integration and cucumber tests
//!
//! Key components:
//! - `FakeDriver`: scripted in-process `SqlDriver`
//! - `next_matching`: wait for a specific event on a subscription

pub mod fake_driver;

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub use fake_driver::{FakeDriver, FAKE_PROCESS_ID};

/// Default wait used by test helpers
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive events until `pick` returns `Some`, skipping the others.
///
/// Fails when the stream closes or nothing matches within `wait`.
pub async fn next_matching<E, T>(
    rx: &mut mpsc::UnboundedReceiver<E>,
    wait: Duration,
    mut pick: impl FnMut(E) -> Option<T>,
) -> Result<T> {
    let search = async {
        while let Some(event) = rx.recv().await {
            if let Some(found) = pick(event) {
                return Some(found);
            }
        }
        None
    };
    match timeout(wait, search).await {
        Ok(Some(found)) => Ok(found),
        Ok(None) => bail!("event stream closed before a matching event arrived"),
        Err(_) => bail!("no matching event within {:?}", wait),
    }
}

/// Drain everything already queued on a subscription
pub fn drain<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
