use crate::cluster::MemberId;
use crate::shipping::actor::WeakShipperClient;
use crate::shipping::timers::time::Clock;
use tokio::sync::watch;
use tokio::time::Instant;

/// RetryTimerHandle is a shipper's single retry timer. Arming replaces whatever deadline was
/// pending, so there is never more than one. Dropping the handle ends the timer task.
pub(crate) struct RetryTimerHandle {
    deadline: watch::Sender<Option<Instant>>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TimerStartError {
    #[error("No async runtime to host the retry timer")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

struct RetryTimerTask<M, C> {
    deadline: watch::Receiver<Option<Instant>>,
    shipper: WeakShipperClient<M>,
    clock: C,
}

impl RetryTimerHandle {
    pub(crate) fn spawn_timer_task<M: MemberId, C: Clock>(
        shipper: WeakShipperClient<M>,
        clock: C,
    ) -> Result<Self, TimerStartError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let (task, handle) = RetryTimerTask::new(shipper, clock);
        runtime.spawn(task.run());

        Ok(handle)
    }

    pub(crate) fn arm(&self, deadline: Instant) {
        // Only fails once the task is gone, in which case there is nobody left to notify.
        let _ = self.deadline.send(Some(deadline));
    }

    pub(crate) fn disarm(&self) {
        let _ = self.deadline.send(None);
    }
}

impl<M: MemberId, C: Clock> RetryTimerTask<M, C> {
    fn new(shipper: WeakShipperClient<M>, clock: C) -> (Self, RetryTimerHandle) {
        let (tx, rx) = watch::channel(None);

        let task = RetryTimerTask {
            deadline: rx,
            shipper,
            clock,
        };
        let handle = RetryTimerHandle { deadline: tx };

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            let next_deadline = *self.deadline.borrow_and_update();

            let wake_time = match next_deadline {
                Some(wake_time) => wake_time,
                None => {
                    // Disarmed. Wait to be armed again, or for the handle to drop.
                    if self.deadline.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            // Deadline changes win over expiry, so a replaced or dropped deadline never fires.
            let expired = tokio::select! {
                biased;
                changed = self.deadline.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    false
                }
                _ = self.clock.sleep_until(wake_time) => true,
            };
            if !expired {
                continue;
            }

            // The shipper has been removed.
            if self.shipper.retry_timeout(wake_time).is_err() {
                return;
            }

            // The shipper re-arms or disarms while handling the timeout. Either way, it's a change.
            if self.deadline.changed().await.is_err() {
                return;
            }
        }
    }
}
