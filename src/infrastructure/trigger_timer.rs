use crate::domain::models::{TriggerDescriptor, TriggerKey};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type TriggerCallback = Arc<dyn Fn(&TriggerDescriptor) + Send + Sync>;
pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

type CancelFn = Box<dyn FnOnce() + Send>;

/// Handle to one installed recurring timer. Cancelling twice is a no-op.
pub struct TimerHandle {
    cancel: Mutex<Option<CancelFn>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn cancel(&self) {
        let cancel = match self.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

pub trait TriggerTimer: Send + Sync {
    /// Installs a timer that fires every week at the descriptor's day and time.
    fn schedule(
        &self,
        descriptor: TriggerDescriptor,
        callback: TriggerCallback,
    ) -> Result<TimerHandle, InfraError>;
}

/// One tokio task per trigger, sleeping until the next local occurrence.
#[derive(Clone)]
pub struct TokioTriggerTimer {
    time_zone: Tz,
    now_provider: NowProvider,
    runtime: tokio::runtime::Handle,
}

impl TokioTriggerTimer {
    pub fn new(time_zone: Tz, runtime: tokio::runtime::Handle) -> Self {
        Self {
            time_zone,
            now_provider: Arc::new(Utc::now),
            runtime,
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }
}

impl TriggerTimer for TokioTriggerTimer {
    fn schedule(
        &self,
        descriptor: TriggerDescriptor,
        callback: TriggerCallback,
    ) -> Result<TimerHandle, InfraError> {
        let time_zone = self.time_zone;
        let now_provider = Arc::clone(&self.now_provider);
        let key = descriptor.key.clone();

        let task = self.runtime.spawn(async move {
            let mut after = now_provider();
            loop {
                let Some(target) = next_occurrence(after, time_zone, &descriptor.key) else {
                    tracing::error!(key = %descriptor.key, "no next occurrence; timer stopped");
                    return;
                };
                let wait = (target - now_provider()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                tracing::debug!(key = %descriptor.key, at = %target, "trigger fired");
                callback(&descriptor);
                after = target;
            }
        });

        tracing::debug!(%key, "timer installed");
        Ok(TimerHandle::new(move || task.abort()))
    }
}

/// The first local occurrence of the key's (day, hour, minute) strictly after `after`.
///
/// A time that falls into a DST gap fires at the first valid minute after it; an ambiguous
/// local time fires at its earlier instant.
pub fn next_occurrence(after: DateTime<Utc>, time_zone: Tz, key: &TriggerKey) -> Option<DateTime<Utc>> {
    let local_date = after.with_timezone(&time_zone).date_naive();
    (0..=8).find_map(|offset| {
        let date = local_date + Duration::days(offset);
        if date.weekday().num_days_from_sunday() != u32::from(key.day) {
            return None;
        }
        let naive = date.and_hms_opt(u32::from(key.hour), u32::from(key.minute), 0)?;
        let instant = resolve_local(time_zone, naive)?;
        (instant > after).then_some(instant)
    })
}

fn resolve_local(time_zone: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut candidate = naive;
    for _ in 0..=180 {
        match time_zone.from_local_datetime(&candidate) {
            LocalResult::Single(value) => return Some(value.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => candidate += Duration::minutes(1),
        }
    }
    None
}

/// Timer double that never fires on its own; tests fire triggers explicitly.
#[derive(Clone, Default)]
pub struct ManualTriggerTimer {
    installed: Arc<Mutex<HashMap<TriggerKey, (TriggerDescriptor, TriggerCallback)>>>,
    history: Arc<Mutex<ManualTimerHistory>>,
}

#[derive(Debug, Default, Clone)]
pub struct ManualTimerHistory {
    pub scheduled: usize,
    pub cancelled: usize,
}

impl ManualTriggerTimer {
    pub fn installed_keys(&self) -> Result<Vec<TriggerKey>, InfraError> {
        let installed = self
            .installed
            .lock()
            .map_err(|error| InfraError::lock_poisoned("manual timer", error))?;
        Ok(installed.keys().cloned().collect())
    }

    pub fn history(&self) -> Result<ManualTimerHistory, InfraError> {
        let history = self
            .history
            .lock()
            .map_err(|error| InfraError::lock_poisoned("manual timer history", error))?;
        Ok(history.clone())
    }

    /// Runs the callback of an installed trigger. Returns false when nothing is installed.
    pub fn fire(&self, key: &TriggerKey) -> Result<bool, InfraError> {
        let entry = {
            let installed = self
                .installed
                .lock()
                .map_err(|error| InfraError::lock_poisoned("manual timer", error))?;
            installed.get(key).cloned()
        };
        match entry {
            Some((descriptor, callback)) => {
                callback(&descriptor);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl TriggerTimer for ManualTriggerTimer {
    fn schedule(
        &self,
        descriptor: TriggerDescriptor,
        callback: TriggerCallback,
    ) -> Result<TimerHandle, InfraError> {
        let key = descriptor.key.clone();
        self.installed
            .lock()
            .map_err(|error| InfraError::lock_poisoned("manual timer", error))?
            .insert(key.clone(), (descriptor, callback));
        self.history
            .lock()
            .map_err(|error| InfraError::lock_poisoned("manual timer history", error))?
            .scheduled += 1;

        let installed = Arc::clone(&self.installed);
        let history = Arc::clone(&self.history);
        Ok(TimerHandle::new(move || {
            let removed = installed
                .lock()
                .map(|mut installed| installed.remove(&key).is_some())
                .unwrap_or(false);
            if removed {
                if let Ok(mut history) = history.lock() {
                    history.cancelled += 1;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ScheduleAction;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(day: u8, hour: u8, minute: u8) -> TriggerKey {
        TriggerKey {
            mac: "aa:bb:cc:00:11:22".to_string(),
            minute,
            hour,
            day,
            action: ScheduleAction::Block,
        }
    }

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn next_occurrence_is_strictly_after() {
        // 2024-05-15 is a Wednesday.
        let wednesday_ten = utc("2024-05-15T10:00:00Z");
        assert_eq!(
            next_occurrence(wednesday_ten, Tz::UTC, &key(3, 22, 30)),
            Some(utc("2024-05-15T22:30:00Z"))
        );
        assert_eq!(
            next_occurrence(wednesday_ten, Tz::UTC, &key(3, 10, 0)),
            Some(utc("2024-05-22T10:00:00Z"))
        );
        assert_eq!(
            next_occurrence(wednesday_ten, Tz::UTC, &key(0, 9, 0)),
            Some(utc("2024-05-19T09:00:00Z"))
        );
    }

    #[test]
    fn local_time_zone_is_honoured() {
        // 07:30 in Berlin during summer time is 05:30 UTC.
        let monday_morning = utc("2024-05-13T00:00:00Z");
        assert_eq!(
            next_occurrence(monday_morning, Tz::Europe__Berlin, &key(1, 7, 30)),
            Some(utc("2024-05-13T05:30:00Z"))
        );
    }

    #[test]
    fn dst_gap_moves_to_first_valid_minute() {
        // Berlin skips 02:00-03:00 on Sunday 2024-03-31.
        let saturday = utc("2024-03-30T12:00:00Z");
        assert_eq!(
            next_occurrence(saturday, Tz::Europe__Berlin, &key(0, 2, 30)),
            Some(utc("2024-03-31T01:00:00Z"))
        );
    }

    #[test]
    fn handle_cancel_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = TimerHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        handle.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manual_timer_fires_until_cancelled() {
        let timer = ManualTriggerTimer::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let descriptor = TriggerDescriptor {
            key: key(2, 8, 0),
            order: 0,
        };

        let handle = timer
            .schedule(
                descriptor.clone(),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("schedule");
        assert!(timer.fire(&descriptor.key).expect("fire"));
        handle.cancel();
        assert!(!timer.fire(&descriptor.key).expect("fire"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.history().expect("history").cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_timer_fires_at_the_occurrence() {
        let start = utc("2024-05-15T22:29:00Z");
        let started = tokio::time::Instant::now();
        let now_provider: NowProvider = Arc::new(move || {
            let elapsed = tokio::time::Instant::now() - started;
            start + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
        });
        let timer = TokioTriggerTimer::new(Tz::UTC, tokio::runtime::Handle::current())
            .with_now_provider(now_provider);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let handle = timer
            .schedule(
                TriggerDescriptor {
                    key: key(3, 22, 30),
                    order: 0,
                },
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("schedule");

        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(std::time::Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        handle.cancel();
        tokio::time::sleep(std::time::Duration::from_secs(7 * 24 * 3600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
