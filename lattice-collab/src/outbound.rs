//! Trailing-edge debouncer for outbound broadcasts.
//!
//! Local edits hit the document store immediately; only the network
//! send is debounced. One shared timer is reset on every call and the
//! latest arguments win — a burst of slider drags or keystrokes inside
//! the window produces exactly one send carrying the final values.
//!
//! The fire callback receives the arguments stored at fire time, and is
//! expected to read any ambient state it needs (user identity, channel
//! handle) when it runs, not when the call was made. That keeps a
//! reconnection between call and fire from sending with a stale
//! identity.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default broadcast coalescing window.
pub const DEFAULT_BROADCAST_WINDOW: Duration = Duration::from_millis(100);

/// A single-timer, latest-args-wins debouncer.
///
/// `call` may be invoked from any task; the fire callback runs on a
/// spawned tokio task after the window elapses without further calls.
/// `cancel` aborts the pending timer, after which nothing fires until
/// the next `call`.
pub struct Debouncer<T: Send + 'static> {
    window: Duration,
    latest: Arc<Mutex<Option<T>>>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    on_fire: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(window: Duration, on_fire: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            window,
            latest: Arc::new(Mutex::new(None)),
            timer: Mutex::new(None),
            on_fire: Arc::new(on_fire),
        }
    }

    /// Store `args` as the pending payload and re-arm the timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn call(&self, args: T) {
        {
            let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
            *latest = Some(args);
        }

        let latest = self.latest.clone();
        let on_fire = self.on_fire.clone();
        let window = self.window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let args = latest.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(args) = args {
                on_fire(args);
            }
        });

        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    /// Abort the pending timer and drop the pending payload.
    pub fn cancel(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Whether a payload is waiting for the timer.
    pub fn pending(&self) -> bool {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl<T: Send + 'static> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(window_ms: u64) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<u32>>>, Debouncer<u32>) {
        let fires = Arc::new(AtomicUsize::new(0));
        let values = Arc::new(Mutex::new(Vec::new()));
        let (f, v) = (fires.clone(), values.clone());
        let debouncer = Debouncer::new(Duration::from_millis(window_ms), move |args: u32| {
            f.fetch_add(1, Ordering::SeqCst);
            v.lock().unwrap().push(args);
        });
        (fires, values, debouncer)
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_one_fire_with_last_args() {
        let (fires, values, debouncer) = counting(30);

        for i in 0..10 {
            debouncer.call(i);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(*values.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_separate_bursts_fire_separately() {
        let (fires, values, debouncer) = counting(20);

        debouncer.call(1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        debouncer.call(2);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(fires.load(Ordering::SeqCst), 2);
        assert_eq!(*values.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_suppresses_fire() {
        let (fires, _, debouncer) = counting(20);

        debouncer.call(1);
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(fires.load(Ordering::SeqCst), 0);
        assert!(!debouncer.pending());
    }

    #[tokio::test]
    async fn test_drop_cancels_pending_timer() {
        let (fires, _, debouncer) = counting(20);
        debouncer.call(1);
        drop(debouncer);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shared_timer_across_distinct_keys() {
        // One debouncer instance serves every layer id: two different
        // layers edited inside one window still produce a single send,
        // carrying the later edit.
        let fires = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (f, s) = (fires.clone(), seen.clone());
        let debouncer = Debouncer::new(
            Duration::from_millis(25),
            move |(layer, value): (u8, u32)| {
                f.fetch_add(1, Ordering::SeqCst);
                s.lock().unwrap().push((layer, value));
            },
        );

        debouncer.call((b'a', 1));
        debouncer.call((b'b', 2));
        tokio::time::sleep(Duration::from_millis(70)).await;

        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![(b'b', 2)]);
    }
}
