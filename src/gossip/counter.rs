use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A counter bounded to `[0, ceiling]` that wakes a waiter whenever it changes.
pub struct UpDownCounter {
    value: Mutex<i64>,
    ceiling: i64,
    changed: Notify,
}

impl UpDownCounter {
    pub fn new(initial: i64, ceiling: i64) -> Self {
        let ceiling = ceiling.max(0);
        Self {
            value: Mutex::new(initial.clamp(0, ceiling)),
            ceiling,
            changed: Notify::new(),
        }
    }

    pub fn up(&self) {
        self.add(1);
    }

    pub fn add(&self, n: i64) {
        {
            let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
            *value = (*value + n).clamp(0, self.ceiling);
        }
        self.changed.notify_one();
    }

    /// Takes one unit if any is left.
    pub fn try_down(&self) -> bool {
        let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        if *value > 0 {
            *value -= 1;
            true
        } else {
            false
        }
    }

    pub fn value(&self) -> i64 {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits until the counter changes or `timeout` elapses.
    pub async fn wait_change(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.changed.notified()).await;
    }
}
