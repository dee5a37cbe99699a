use std::future::Future;
use std::pin::Pin;

use futures::future::Shared;
use futures::FutureExt;
use tokio::select;
use tokio::sync::watch;
use tracing::info;

/// A cloneable future that resolves once shutdown has been requested.
///
/// Workers hold one of these and poll it between batches; the pool holds the
/// matching [`ShutdownController`] and triggers it during `close`.
pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Programmatic shutdown trigger.
///
/// Every signal obtained from [`ShutdownController::signal`] resolves after
/// [`ShutdownController::trigger`] is called. Dropping the controller also
/// resolves outstanding signals, so an owner going away never strands its
/// workers.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A new signal tied to this controller.
    pub fn signal(&self) -> ShutdownSignal {
        let mut rx = self.tx.subscribe();
        async move {
            // An Err means the controller was dropped, which counts as a
            // shutdown request.
            let _ = rx.wait_for(|stop| *stop).await;
        }
        .boxed()
        .shared()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(unix)]
async fn raw_os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("Failed to listen for SIGINT");
    let mut terminate =
        signal(SignalKind::terminate()).expect("Failed to listen for SIGTERM");

    select! {
        _ = interrupt.recv() => (),
        _ = terminate.recv() => (),
    }
}

#[cfg(not(unix))]
async fn raw_os_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl-c");
}

/// Resolves on SIGINT/SIGTERM (ctrl-c elsewhere).
pub fn os_shutdown_signal() -> ShutdownSignal {
    async {
        raw_os_signal().await;
        info!("Shutdown signal received, finishing in-flight work");
    }
    .boxed()
    .shared()
}

/// Resolves when either of the two given signals resolves.
pub fn merged(a: ShutdownSignal, b: ShutdownSignal) -> ShutdownSignal {
    async move {
        select! {
            _ = a => (),
            _ = b => (),
        }
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_resolves_on_trigger() {
        let controller = ShutdownController::new();
        let signal = controller.signal();

        controller.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("signal should resolve after trigger");
        assert!(controller.is_triggered());
    }

    #[tokio::test]
    async fn signals_are_cloneable_and_late_subscribers_resolve() {
        let controller = ShutdownController::new();
        controller.trigger();

        // Subscribed after the trigger, must still resolve.
        let late = controller.signal();
        tokio::time::timeout(Duration::from_secs(1), late)
            .await
            .expect("late signal should resolve");
    }

    #[tokio::test]
    async fn dropping_controller_resolves_signal() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        drop(controller);

        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("signal should resolve once the controller is gone");
    }

    #[tokio::test]
    async fn merged_resolves_on_either() {
        let a = ShutdownController::new();
        let b = ShutdownController::new();
        let signal = merged(a.signal(), b.signal());

        b.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("merged signal should resolve");
    }
}
