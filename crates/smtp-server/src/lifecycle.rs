//! Tracks the in-flight work of one server so that shutdown can stop
//! accepting and then wait for running transactions to complete.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};

/// Represents a transaction which must be allowed to run to
/// completion. While any Activity is alive, `wait_for_activities`
/// cannot complete.
#[derive(Debug)]
pub(crate) struct Activity {
    _tx: MPSCSender<()>,
}

pub(crate) struct LifeCycle {
    /// The root sender; new activities clone it. Taken on shutdown
    /// so that the receiver sees the channel close once every
    /// activity has been dropped.
    root: Mutex<Option<MPSCSender<()>>>,
    activity_rx: tokio::sync::Mutex<MPSCReceiver<()>>,
    shutting_down: AtomicBool,
    stop_tx: WatchSender<bool>,
}

impl LifeCycle {
    pub fn new() -> Self {
        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(1);
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        Self {
            root: Mutex::new(Some(activity_tx)),
            activity_rx: tokio::sync::Mutex::new(activity_rx),
            shutting_down: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Returns None once shutdown has been initiated
    pub fn activity(&self) -> Option<Activity> {
        let root = self.root.lock();
        root.as_ref().map(|tx| Activity { _tx: tx.clone() })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// A receiver that flips to true when shutdown begins
    pub fn subscribe(&self) -> WatchReceiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Stop admitting new work. Returns true for the call that
    /// actually initiated shutdown.
    pub fn initiate_shutdown(&self) -> bool {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.root.lock().take();
        self.stop_tx.send_replace(true);
        true
    }

    /// Wait until every Activity has been dropped.
    /// Only meaningful after `initiate_shutdown`.
    pub async fn wait_for_activities(&self) {
        let mut rx = self.activity_rx.lock().await;
        // Nothing is ever sent; recv returns None once all
        // of the senders are gone.
        while rx.recv().await.is_some() {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_activities() {
        let life_cycle = LifeCycle::new();
        let activity = life_cycle.activity().unwrap();
        let mut stop = life_cycle.subscribe();

        assert!(life_cycle.initiate_shutdown());
        assert!(!life_cycle.initiate_shutdown());
        assert!(life_cycle.activity().is_none());
        stop.wait_for(|stopping| *stopping).await.unwrap();

        // The outstanding activity blocks the wait
        assert!(tokio::time::timeout(
            Duration::from_millis(50),
            life_cycle.wait_for_activities()
        )
        .await
        .is_err());

        drop(activity);
        tokio::time::timeout(Duration::from_secs(5), life_cycle.wait_for_activities())
            .await
            .unwrap();
        // and waiting again is fine
        life_cycle.wait_for_activities().await;
    }
}
