use crate::cluster::{MemberId, MembershipListener, RaftMembership};
use crate::shipping::actor::{ShipperActor, ShipperClient};
use crate::shipping::shipper::{RaftLogShipper, ShipperConfig};
use crate::shipping::stop_signal;
use crate::shipping::timers::{Clock, RealClock};
use crate::shipping::{LeaderContext, ShipCommand};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// RaftLogShippingManager keeps exactly one shipper running per replication member (other than
/// ourselves) while we are leader, and routes the Raft core's ship commands to them.
pub struct RaftLogShippingManager<M: MemberId, C: Clock = RealClock> {
    logger: slog::Logger,
    myself: M,
    membership: Arc<dyn RaftMembership<M>>,
    shipper_config: ShipperConfig<M, C>,
    runtime: tokio::runtime::Handle,
    state: Mutex<ManagerState<M>>,
}

struct ManagerState<M> {
    shippers: HashMap<M, ShipperEntry<M>>,
    last_leader_context: Option<LeaderContext>,
    running: bool,
    stopped: bool,
}

// Dropping the entry stops the shipper: the stopper makes it discard anything still queued, and
// dropping the client closes its queue.
struct ShipperEntry<M> {
    client: ShipperClient<M>,
    _stopper: stop_signal::Stopper,
}

impl<M: MemberId, C: Clock> RaftLogShippingManager<M, C> {
    pub(crate) fn new(
        logger: slog::Logger,
        myself: M,
        membership: Arc<dyn RaftMembership<M>>,
        shipper_config: ShipperConfig<M, C>,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let manager = Arc::new(RaftLogShippingManager {
            logger,
            myself,
            membership,
            shipper_config,
            runtime,
            state: Mutex::new(ManagerState {
                shippers: HashMap::new(),
                last_leader_context: None,
                running: false,
                stopped: false,
            }),
        });

        let weak_manager = Arc::downgrade(&manager);
        let listener: Weak<dyn MembershipListener> = weak_manager;
        manager.membership.register_listener(listener);

        manager
    }

    /// Starts shipping to every current replication member. Also used to resume after `pause()`.
    pub fn start(&self, leader_context: LeaderContext) {
        let mut state = self.lock();
        if state.stopped {
            slog::info!(self.logger, "Ignoring start. Log shipping is stopped for good.");
            return;
        }

        slog::info!(self.logger, "Starting log shipping in term {:?}", leader_context.term);
        state.running = true;
        state.last_leader_context = Some(leader_context);

        for member in self.membership.replication_members() {
            self.ensure_shipper_running_locked(&mut state, member, leader_context);
        }
    }

    /// Stops and discards every shipper. `start()` brings them back, e.g. after re-election.
    pub fn pause(&self) {
        let mut state = self.lock();
        self.pause_locked(&mut state);
    }

    /// Like `pause()`, but final.
    pub fn stop(&self) {
        let mut state = self.lock();
        self.pause_locked(&mut state);
        state.stopped = true;
    }

    /// Returns whether a shipper is running for `member` once this returns. Never ships to
    /// ourselves.
    pub fn ensure_shipper_running(&self, member: M, leader_context: LeaderContext) -> bool {
        let mut state = self.lock();
        if state.stopped {
            return false;
        }

        self.ensure_shipper_running_locked(&mut state, member, leader_context)
    }

    /// Hands each command to the shipper(s) it concerns. A shipper which can't take the command
    /// is logged and skipped; it recovers on its own retry timer.
    pub fn handle_commands(&self, commands: impl IntoIterator<Item = ShipCommand<M>>, leader_context: LeaderContext) {
        let mut state = self.lock();
        state.last_leader_context = Some(leader_context);

        for command in commands {
            for (member, shipper) in state.shippers.iter() {
                if !command.applies_to(member) {
                    continue;
                }
                if let Err(e) = shipper.client.try_apply(command.clone(), leader_context) {
                    slog::warn!(
                        self.logger,
                        "Dropped command {:?} for follower {:?}: {}",
                        command,
                        member,
                        e
                    );
                }
            }
        }
    }

    /// Members we currently run a shipper for.
    pub fn shipper_members(&self) -> HashSet<M> {
        self.lock().shippers.keys().cloned().collect()
    }

    fn ensure_shipper_running_locked(
        &self,
        state: &mut ManagerState<M>,
        member: M,
        leader_context: LeaderContext,
    ) -> bool {
        if member == self.myself {
            return false;
        }
        if state.shippers.contains_key(&member) {
            return true;
        }

        let (client, receiver) = ShipperClient::new();
        let (stopper, stop_check) = stop_signal::new();
        let shipper = RaftLogShipper::new(&self.logger, member.clone(), self.shipper_config.clone());
        let actor = ShipperActor::new(receiver, client.weak(), stop_check, shipper);
        self.runtime.spawn(actor.run_event_loop());

        // The actor was just spawned, so its queue is open.
        if let Err(e) = client.try_start(leader_context) {
            slog::error!(self.logger, "Failed to start shipper for {:?}: {}", member, e);
            return false;
        }

        slog::info!(self.logger, "Started shipper for {:?}", member);
        state.shippers.insert(
            member,
            ShipperEntry {
                client,
                _stopper: stopper,
            },
        );

        true
    }

    fn pause_locked(&self, state: &mut ManagerState<M>) {
        state.running = false;

        let count = state.shippers.len();
        state.shippers.clear();
        slog::info!(self.logger, "Paused log shipping. Stopped {} shipper(s).", count);
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState<M>> {
        self.state.lock().expect("RaftLogShippingManager mutex guard poison")
    }
}

impl<M: MemberId, C: Clock> MembershipListener for RaftLogShippingManager<M, C> {
    fn on_membership_changed(&self) {
        let mut state = self.lock();
        let leader_context = match state.last_leader_context {
            Some(leader_context) if state.running => leader_context,
            _ => return,
        };

        let members = self.membership.replication_members();

        let removed: Vec<M> = state
            .shippers
            .keys()
            .filter(|member| !members.contains(*member))
            .cloned()
            .collect();
        for member in removed {
            state.shippers.remove(&member);
            slog::info!(self.logger, "Stopped shipper for removed member {:?}", member);
        }

        for member in members {
            self.ensure_shipper_running_locked(&mut state, member, leader_context);
        }
    }
}
