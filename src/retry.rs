//! Retry loop with bounded exponential backoff and panic containment.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::logger::Logger;

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// A panic intercepted by [`contain`].
#[derive(Debug)]
pub struct Crash {
    /// The panic payload rendered as text.
    pub message: String,
    /// Stack trace captured where the panic was raised, when available.
    pub backtrace: Option<String>,
}

/// Runs `work` to completion, intercepting any panic raised while polling it.
///
/// A panic is logged through `logger` together with its backtrace and returned
/// as a [`Crash`]; it never propagates past this call.
///
/// # Errors
///
/// Returns the intercepted panic.
pub async fn contain<F, T>(work: F, logger: &dyn Logger) -> Result<T, Crash>
where
    F: Future<Output = T>,
{
    install_backtrace_hook();

    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
            let crash = Crash {
                message: panic_message(payload.as_ref()),
                backtrace: PANIC_BACKTRACE
                    .with(|slot| slot.borrow_mut().take())
                    .as_ref()
                    .map(ToString::to_string),
            };

            logger.log(&format!(
                "kuberesolver: recovered from panic: {}\n{}",
                crash.message,
                crash.backtrace.as_deref().unwrap_or("<no backtrace>")
            ));

            Err(crash)
        }
    }
}

/// Calls `work` repeatedly until `cancel` fires.
///
/// Returns immediately, without running `work`, if `cancel` has already fired.
/// Every run is wrapped in [`contain`] and followed by a wait of the current
/// period. The period doubles after each wait and goes back to `initial` once
/// doubling would exceed `max`.
pub async fn until<W, F>(
    state: &mut W,
    mut work: F,
    initial: Duration,
    max: Duration,
    cancel: &CancellationToken,
    logger: &dyn Logger,
) where
    W: Send,
    F: for<'a> FnMut(&'a mut W) -> BoxFuture<'a, ()>,
{
    if cancel.is_cancelled() {
        return;
    }

    let mut period = initial;

    loop {
        let _ = contain(work(state), logger).await;

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(period) => {
                period = next_period(period, initial, max);
            }
        }
    }
}

fn next_period(period: Duration, initial: Duration, max: Duration) -> Duration {
    period
        .checked_mul(2)
        .filter(|next| *next <= max)
        .unwrap_or(initial)
}

fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;

    fn quiet() -> impl Logger {
        |_: &str| {}
    }

    #[test]
    fn next_period_doubles_then_resets() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(4);

        assert_eq!(next_period(initial, initial, max), Duration::from_secs(2));
        assert_eq!(next_period(Duration::from_secs(2), initial, max), max);
        assert_eq!(next_period(max, initial, max), initial);
        assert_eq!(next_period(Duration::MAX, initial, max), initial);
    }

    #[tokio::test]
    async fn contain_returns_value() {
        let got = contain(async { 7 }, &quiet()).await;
        assert_eq!(got.unwrap(), 7);
    }

    #[tokio::test]
    async fn contain_intercepts_panic_and_logs() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let logger = move |message: &str| sink.lock().unwrap().push(message.to_string());

        let crash = contain(async { panic!("watch exploded") }, &logger)
            .await
            .unwrap_err();

        assert_eq!(crash.message, "watch exploded");
        assert!(crash.backtrace.is_some());

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("recovered from panic: watch exploded"));
    }

    struct Runs {
        at: Vec<Instant>,
        stop_after: usize,
        cancel: CancellationToken,
        panic: bool,
    }

    impl Runs {
        fn new(stop_after: usize, cancel: &CancellationToken) -> Self {
            Self {
                at: Vec::new(),
                stop_after,
                cancel: cancel.clone(),
                panic: false,
            }
        }

        async fn run(&mut self) {
            self.at.push(Instant::now());
            if self.at.len() == self.stop_after {
                self.cancel.cancel();
            }
            if self.panic {
                panic!("run {}", self.at.len());
            }
        }
    }

    #[tokio::test]
    async fn until_skips_work_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut runs = Runs::new(usize::MAX, &cancel);

        until(
            &mut runs,
            |r| r.run().boxed(),
            Duration::from_secs(1),
            Duration::from_secs(30),
            &cancel,
            &quiet(),
        )
        .await;

        assert!(runs.at.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn until_backs_off_and_resets() {
        let cancel = CancellationToken::new();
        let mut runs = Runs::new(5, &cancel);

        until(
            &mut runs,
            |r| r.run().boxed(),
            Duration::from_secs(1),
            Duration::from_secs(4),
            &cancel,
            &quiet(),
        )
        .await;

        let gaps: Vec<u64> = runs
            .at
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn until_keeps_running_after_panics() {
        let cancel = CancellationToken::new();
        let mut runs = Runs::new(3, &cancel);
        runs.panic = true;

        until(
            &mut runs,
            |r| r.run().boxed(),
            Duration::from_millis(10),
            Duration::from_millis(100),
            &cancel,
            &quiet(),
        )
        .await;

        assert_eq!(runs.at.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn until_stops_during_backoff() {
        let cancel = CancellationToken::new();
        let mut runs = Runs::new(usize::MAX, &cancel);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        until(
            &mut runs,
            |r| r.run().boxed(),
            Duration::from_secs(1),
            Duration::from_secs(30),
            &cancel,
            &quiet(),
        )
        .await;

        // runs at t=0 and t=1s, cancelled during the 2s wait
        assert_eq!(runs.at.len(), 2);
    }
}
