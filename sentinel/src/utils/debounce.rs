//! Keyed debouncing for bursts of events.
//!
//! A [`Debouncer`] holds the latest value per key until no new value has
//! arrived for the configured interval, then emits it once together with the
//! number of values it absorbed. An optional maximum delay caps how long a key
//! can be held back while values keep arriving.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use sentinel::utils::debounce::Debouncer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (output_tx, mut output_rx) = mpsc::channel(16);
//!     let debouncer = Debouncer::new(Duration::from_millis(100), output_tx);
//!
//!     debouncer.send("pkgA".to_string(), 1).await.unwrap();
//!     debouncer.send("pkgA".to_string(), 2).await.unwrap();
//!
//!     let fired = output_rx.recv().await.unwrap();
//!     assert_eq!(fired.key, "pkgA");
//!     assert_eq!(fired.value, 2);
//!     assert_eq!(fired.coalesced, 2);
//! }
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default debounce interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Capacity of the debouncer's input queue.
const INPUT_CAPACITY: usize = 1024;

/// Errors returned when handing a value to the debouncer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebouncerError {
    /// The background task has stopped.
    #[error("debouncer channel closed")]
    ChannelClosed,

    /// The input queue is full.
    #[error("debouncer queue full")]
    Full,
}

/// A value released by the debouncer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debounced<K, V> {
    pub key: K,
    /// The most recent value sent for `key`.
    pub value: V,
    /// How many values were collapsed into this one.
    pub coalesced: usize,
}

enum Command<K, V> {
    Push(K, V),
    Cancel(K),
}

struct Pending<V> {
    value: V,
    coalesced: usize,
    deadline: Instant,
    hard_deadline: Option<Instant>,
}

/// Collapses bursts of values per key into a single emission.
///
/// The debounce logic runs in a tokio task, so a debouncer must be created
/// inside a runtime. Dropping the debouncer flushes whatever is still pending.
#[derive(Debug)]
pub struct Debouncer<K, V> {
    input_tx: mpsc::Sender<Command<K, V>>,
}

impl<K, V> Debouncer<K, V>
where
    K: Clone + Eq + Hash + Send + Debug + 'static,
    V: Send + 'static,
{
    /// Creates a debouncer that waits `interval` after the last value.
    #[must_use]
    pub fn new(interval: Duration, output_tx: mpsc::Sender<Debounced<K, V>>) -> Self {
        Self::spawn(interval, None, output_tx)
    }

    /// Creates a debouncer that also fires no later than `max_delay` after
    /// the first value of a burst, even if values keep arriving.
    #[must_use]
    pub fn with_max_delay(
        interval: Duration,
        max_delay: Duration,
        output_tx: mpsc::Sender<Debounced<K, V>>,
    ) -> Self {
        Self::spawn(interval, Some(max_delay), output_tx)
    }

    fn spawn(
        interval: Duration,
        max_delay: Option<Duration>,
        output_tx: mpsc::Sender<Debounced<K, V>>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        tokio::spawn(run_debounce_loop(interval, max_delay, input_rx, output_tx));
        Self { input_tx }
    }

    /// Queues `value` for `key`, replacing any pending value and restarting
    /// the key's timer.
    ///
    /// # Errors
    ///
    /// Returns [`DebouncerError::ChannelClosed`] if the background task has
    /// stopped.
    pub async fn send(&self, key: K, value: V) -> Result<(), DebouncerError> {
        self.input_tx
            .send(Command::Push(key, value))
            .await
            .map_err(|_| DebouncerError::ChannelClosed)
    }

    /// Queues `value` for `key` without waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns [`DebouncerError::Full`] or [`DebouncerError::ChannelClosed`].
    pub fn try_send(&self, key: K, value: V) -> Result<(), DebouncerError> {
        self.input_tx
            .try_send(Command::Push(key, value))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DebouncerError::Full,
                mpsc::error::TrySendError::Closed(_) => DebouncerError::ChannelClosed,
            })
    }

    /// Drops any pending value for `key` without emitting it.
    pub fn cancel(&self, key: K) -> bool {
        self.input_tx.try_send(Command::Cancel(key)).is_ok()
    }
}

async fn run_debounce_loop<K, V>(
    interval: Duration,
    max_delay: Option<Duration>,
    mut input_rx: mpsc::Receiver<Command<K, V>>,
    output_tx: mpsc::Sender<Debounced<K, V>>,
) where
    K: Clone + Eq + Hash + Debug,
{
    let mut pending: HashMap<K, Pending<V>> = HashMap::new();

    debug!(
        interval_ms = interval.as_millis(),
        max_delay_ms = max_delay.map(|d| d.as_millis()),
        "Starting debounce loop"
    );

    loop {
        let next_deadline = pending.values().map(Pending::fire_at).min();

        tokio::select! {
            command = input_rx.recv() => match command {
                Some(Command::Push(key, value)) => {
                    let now = Instant::now();
                    let coalesced = match pending.get_mut(&key) {
                        Some(entry) => {
                            entry.value = value;
                            entry.coalesced += 1;
                            entry.deadline = now + interval;
                            entry.coalesced
                        }
                        None => {
                            pending.insert(key.clone(), Pending {
                                value,
                                coalesced: 1,
                                deadline: now + interval,
                                hard_deadline: max_delay.map(|delay| now + delay),
                            });
                            1
                        }
                    };
                    trace!(key = ?key, coalesced, "Debounce timer reset");
                }
                Some(Command::Cancel(key)) => {
                    if pending.remove(&key).is_some() {
                        trace!(key = ?key, "Cancelled pending value");
                    }
                }
                None => {
                    debug!(pending = pending.len(), "Input closed, flushing pending values");
                    for (key, entry) in pending.drain() {
                        emit(&output_tx, key, entry).await;
                    }
                    break;
                }
            },
            () = sleep_until(next_deadline) => {
                let now = Instant::now();
                let expired: Vec<K> = pending
                    .iter()
                    .filter(|(_, entry)| entry.fire_at() <= now)
                    .map(|(key, _)| key.clone())
                    .collect();

                for key in expired {
                    if let Some(entry) = pending.remove(&key) {
                        emit(&output_tx, key, entry).await;
                    }
                }
            }
        }
    }

    debug!("Debounce loop terminated");
}

impl<V> Pending<V> {
    fn fire_at(&self) -> Instant {
        match self.hard_deadline {
            Some(hard) => hard.min(self.deadline),
            None => self.deadline,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn emit<K: Debug, V>(output_tx: &mpsc::Sender<Debounced<K, V>>, key: K, entry: Pending<V>) {
    trace!(key = ?key, coalesced = entry.coalesced, "Emitting debounced value");
    let fired = Debounced {
        key,
        value: entry.value,
        coalesced: entry.coalesced,
    };
    if let Err(e) = output_tx.send(fired).await {
        warn!(key = ?e.0.key, "Debounced value dropped, receiver closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn debouncer<V: Send + 'static>(
        interval_ms: u64,
    ) -> (Debouncer<String, V>, mpsc::Receiver<Debounced<String, V>>) {
        let (tx, rx) = mpsc::channel(16);
        (Debouncer::new(Duration::from_millis(interval_ms), tx), rx)
    }

    #[tokio::test]
    async fn single_value_emitted_after_interval() {
        let (debouncer, mut rx) = debouncer(50);
        debouncer.send("pkgA".to_string(), 42).await.unwrap();

        let fired = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("should fire")
            .unwrap();
        assert_eq!(fired.key, "pkgA");
        assert_eq!(fired.value, 42);
        assert_eq!(fired.coalesced, 1);
    }

    #[tokio::test]
    async fn burst_collapses_to_last_value() {
        let (debouncer, mut rx) = debouncer(50);
        for i in 0..20 {
            debouncer.send("pkgA".to_string(), i).await.unwrap();
        }

        let fired = timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.value, 19);
        assert_eq!(fired.coalesced, 20);

        let more = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(more.is_err(), "burst should fire once");
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (debouncer, mut rx) = debouncer(50);
        debouncer.send("a".to_string(), 1).await.unwrap();
        debouncer.send("b".to_string(), 10).await.unwrap();
        debouncer.send("a".to_string(), 2).await.unwrap();

        let mut fired = HashMap::new();
        for _ in 0..2 {
            let d = timeout(Duration::from_millis(200), rx.recv())
                .await
                .unwrap()
                .unwrap();
            fired.insert(d.key, (d.value, d.coalesced));
        }
        assert_eq!(fired.get("a"), Some(&(2, 2)));
        assert_eq!(fired.get("b"), Some(&(10, 1)));
    }

    #[tokio::test]
    async fn new_value_restarts_timer() {
        let (debouncer, mut rx) = debouncer(100);
        debouncer.send("pkgA".to_string(), 1).await.unwrap();
        sleep(Duration::from_millis(60)).await;
        debouncer.send("pkgA".to_string(), 2).await.unwrap();

        let early = timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(early.is_err(), "timer should have restarted");

        let fired = timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.value, 2);
    }

    #[tokio::test]
    async fn max_delay_caps_continuous_bursts() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer =
            Debouncer::with_max_delay(Duration::from_millis(80), Duration::from_millis(150), tx);

        let sender = async {
            for i in 0..10 {
                debouncer.send("pkgA".to_string(), i).await.unwrap();
                sleep(Duration::from_millis(40)).await;
            }
        };
        let receiver = async {
            timeout(Duration::from_millis(350), rx.recv())
                .await
                .expect("max delay should force a fire")
                .unwrap()
        };
        let ((), fired) = tokio::join!(sender, receiver);

        assert!(fired.coalesced < 10);
    }

    #[tokio::test]
    async fn cancel_drops_pending_value() {
        let (debouncer, mut rx) = debouncer(50);
        debouncer.send("pkgA".to_string(), 1).await.unwrap();
        assert!(debouncer.cancel("pkgA".to_string()));

        let fired = timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(fired.is_err(), "cancelled value should not fire");
    }

    #[tokio::test]
    async fn drop_flushes_pending() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = Debouncer::new(Duration::from_secs(10), tx);
        debouncer.send("pkgA".to_string(), 7).await.unwrap();
        drop(debouncer);

        let fired = timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.value, 7);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn try_send_succeeds_with_capacity() {
        let (debouncer, mut rx) = debouncer(10);
        assert_eq!(debouncer.try_send("pkgA".to_string(), 3), Ok(()));

        let fired = timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.value, 3);
    }

    #[test]
    fn error_display() {
        assert_eq!(
            DebouncerError::ChannelClosed.to_string(),
            "debouncer channel closed"
        );
        assert_eq!(DebouncerError::Full.to_string(), "debouncer queue full");
    }
}
