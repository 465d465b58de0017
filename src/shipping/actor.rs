use crate::cluster::MemberId;
use crate::shipping::shipper::RaftLogShipper;
use crate::shipping::stop_signal;
use crate::shipping::timers::{Clock, RetryTimerHandle};
use crate::shipping::{LeaderContext, ShipCommand};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Everything a shipper reacts to arrives as an Event on its queue, so external commands and its
/// own retry timer are handled one at a time.
#[derive(Debug)]
pub(crate) enum Event<M> {
    Start(LeaderContext),
    Command(ShipCommand<M>, LeaderContext),
    RetryTimeout(Instant),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ShipCommandError {
    #[error("Shipper has stopped")]
    ShipperStopped,
}

impl<T> From<mpsc::error::SendError<T>> for ShipCommandError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        ShipCommandError::ShipperStopped
    }
}

// Unbounded, so a burst of commands is never dropped and sending never waits.
pub(crate) struct ShipperClient<M> {
    sender: mpsc::UnboundedSender<Event<M>>,
}

/// Weak handle to a shipper's queue. Holding one does not keep the shipper alive.
#[derive(Clone)]
pub(crate) struct WeakShipperClient<M> {
    sender: mpsc::WeakUnboundedSender<Event<M>>,
}

impl<M: MemberId> ShipperClient<M> {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Event<M>>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (ShipperClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakShipperClient<M> {
        WeakShipperClient {
            sender: self.sender.downgrade(),
        }
    }

    // Never awaits. Callers hold the manager lock, and a slow follower must not stall the rest.
    pub(crate) fn try_start(&self, leader_context: LeaderContext) -> Result<(), ShipCommandError> {
        self.sender.send(Event::Start(leader_context))?;
        Ok(())
    }

    pub(crate) fn try_apply(
        &self,
        command: ShipCommand<M>,
        leader_context: LeaderContext,
    ) -> Result<(), ShipCommandError> {
        self.sender.send(Event::Command(command, leader_context))?;
        Ok(())
    }
}

impl<M: MemberId> WeakShipperClient<M> {
    pub(crate) fn retry_timeout(&self, wake_time: Instant) -> Result<(), ShipCommandError> {
        let sender = self.sender.upgrade().ok_or(ShipCommandError::ShipperStopped)?;
        sender.send(Event::RetryTimeout(wake_time))?;
        Ok(())
    }
}

/// ShipperActor is a shipper in actor model.
pub(crate) struct ShipperActor<M: MemberId, C: Clock> {
    receiver: mpsc::UnboundedReceiver<Event<M>>,
    // Handed to the retry timer on start, so timeouts land on our own queue.
    myself: WeakShipperClient<M>,
    stop_check: stop_signal::StopCheck,
    shipper: RaftLogShipper<M, C>,
}

impl<M: MemberId, C: Clock> ShipperActor<M, C> {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<Event<M>>,
        myself: WeakShipperClient<M>,
        stop_check: stop_signal::StopCheck,
        shipper: RaftLogShipper<M, C>,
    ) -> Self {
        ShipperActor {
            receiver,
            myself,
            stop_check,
            shipper,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            // Removal is final, even for events that were already queued.
            if self.stop_check.should_stop() {
                break;
            }
            self.handle_event(event);
        }

        self.shipper.stop();
    }

    // This must NOT be async. Sends are fire-and-forget and reads come from local storage.
    fn handle_event(&mut self, event: Event<M>) {
        match event {
            Event::Start(leader_context) => {
                let retry_timer = RetryTimerHandle::spawn_timer_task(self.myself.clone(), self.shipper.clock());
                self.shipper.start(leader_context, retry_timer);
            }
            Event::Command(command, leader_context) => match command {
                ShipCommand::Mismatch {
                    last_remote_append_index,
                    ..
                } => self.shipper.on_mismatch(last_remote_append_index, leader_context),
                ShipCommand::Match { new_match_index, .. } => self.shipper.on_match(new_match_index, leader_context),
                ShipCommand::NewEntries {
                    prev_log_index,
                    prev_log_term,
                    entries,
                } => self
                    .shipper
                    .on_new_entries(prev_log_index, prev_log_term, &entries, leader_context),
                ShipCommand::CommitUpdate => self.shipper.on_commit_update(leader_context),
            },
            Event::RetryTimeout(wake_time) => {
                self.shipper.on_retry_timeout(wake_time);
            }
        }
    }
}
