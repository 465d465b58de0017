use crate::api::ShippingOptionsValidated;
use crate::cluster::MemberId;
use crate::commitlog::{InFlightCache, Index, RaftLogEntry, ReadableRaftLog, Term};
use crate::shipping::entry_reader::EntryReader;
use crate::shipping::messages::{AppendEntriesRequest, Heartbeat, LogCompactionInfo, LogIdentity, Outbound, RaftMessage};
use crate::shipping::timers::{Clock, RealClock, RetryTimerHandle, TimerStartError};
use crate::shipping::LeaderContext;
use std::io;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    // Follower's position is unknown. Probe one entry at a time until it matches.
    Mismatch,
    // Follower is behind. Ship a batch, wait for its match, ship the next.
    Catchup,
    // Follower is caught up. Forward new entries as they are appended, without waiting.
    Pipeline,
}

/// Everything shippers of the same leader have in common.
#[derive(Clone)]
pub(crate) struct ShipperConfig<M: MemberId, C: Clock> {
    pub(crate) leader: M,
    pub(crate) log_identity: LogIdentity,
    pub(crate) raft_log: Arc<dyn ReadableRaftLog>,
    pub(crate) in_flight: Arc<dyn InFlightCache>,
    pub(crate) outbound: Arc<dyn Outbound<M>>,
    pub(crate) clock: C,
    pub(crate) options: ShippingOptionsValidated,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ShipError {
    #[error("Failed to read log at index {index:?}")]
    LogRead {
        index: Index,
        #[source]
        source: io::Error,
    },
}

/// RaftLogShipper replicates the leader's log to a single follower. It decides what to send next
/// from the follower's match/mismatch replies, the leader's appends and its own retry timer. It
/// never waits for a reply; progress is only ever observed as a later event.
pub(crate) struct RaftLogShipper<M: MemberId, C: Clock = RealClock> {
    logger: slog::Logger,
    follower: M,
    config: ShipperConfig<M, C>,

    retry_timer: Option<RetryTimerHandle>,
    timeout_deadline: Option<Instant>,

    mode: Mode,
    match_index: Option<Index>,
    last_sent_index: Index,
    last_leader_context: Option<LeaderContext>,
}

impl<M: MemberId, C: Clock> RaftLogShipper<M, C> {
    pub(crate) fn new(logger: &slog::Logger, follower: M, config: ShipperConfig<M, C>) -> Self {
        let logger = logger.new(slog::o!("Follower" => format!("{:?}", follower)));

        RaftLogShipper {
            logger,
            follower,
            config,
            retry_timer: None,
            timeout_deadline: None,
            mode: Mode::Mismatch,
            match_index: None,
            last_sent_index: Index::new(0),
            last_leader_context: None,
        }
    }

    pub(crate) fn clock(&self) -> C {
        self.config.clock.clone()
    }

    pub(crate) fn start(
        &mut self,
        leader_context: LeaderContext,
        retry_timer: Result<RetryTimerHandle, TimerStartError>,
    ) {
        slog::info!(self.logger, "Starting log shipper. {}", self.status());

        match retry_timer {
            Ok(retry_timer) => self.retry_timer = Some(retry_timer),
            // Still worth the first send. From here on we only move when the follower replies.
            Err(e) => slog::error!(self.logger, "Failed to start retry timer: {}. {}", e, self.status()),
        }

        self.last_leader_context = Some(leader_context);
        self.send_single(self.config.raft_log.append_index(), leader_context);
    }

    pub(crate) fn stop(&mut self) {
        if self.retry_timer.is_none() && self.timeout_deadline.is_none() {
            return;
        }
        slog::info!(self.logger, "Stopping log shipper. {}", self.status());

        self.abort_timeout();
        self.retry_timer = None;
    }

    pub(crate) fn on_mismatch(&mut self, last_remote_append_index: Option<Index>, leader_context: LeaderContext) {
        match self.mode {
            Mode::Mismatch => {
                // Step back one past the last probe, but never beyond the follower's own end.
                let probe = self
                    .last_sent_index
                    .checked_minus(1)
                    .min(last_remote_append_index)
                    .unwrap_or(Index::new(0));
                self.send_single(Some(probe), leader_context);
            }
            Mode::Catchup | Mode::Pipeline => {
                slog::info!(self.logger, "Mismatch, moving to MISMATCH. {}", self.status());
                self.mode = Mode::Mismatch;
                self.send_single(Some(self.last_sent_index), leader_context);
            }
        }

        self.last_leader_context = Some(leader_context);
    }

    pub(crate) fn on_match(&mut self, new_match_index: Option<Index>, leader_context: LeaderContext) {
        let progress = new_match_index > self.match_index;
        if progress {
            self.match_index = new_match_index;
        } else {
            slog::warn!(
                self.logger,
                "Match index not progressing. This should be transient. new_match_index={:?} {}",
                new_match_index,
                self.status()
            );
        }

        match self.mode {
            Mode::Mismatch => {
                if self.send_next_batch_after_match(leader_context) {
                    slog::info!(self.logger, "Caught up after mismatch, moving to PIPELINE. {}", self.status());
                    self.mode = Mode::Pipeline;
                } else {
                    slog::info!(self.logger, "Starting catch up after mismatch, moving to CATCHUP. {}", self.status());
                    self.mode = Mode::Catchup;
                }
            }
            Mode::Catchup => {
                if self.match_index >= Some(self.last_sent_index) && self.send_next_batch_after_match(leader_context)
                {
                    slog::info!(self.logger, "Caught up, moving to PIPELINE. {}", self.status());
                    self.mode = Mode::Pipeline;
                }
            }
            Mode::Pipeline => {
                if self.match_index == Some(self.last_sent_index) {
                    self.abort_timeout();
                } else if progress {
                    self.schedule_timeout();
                }
            }
        }

        self.last_leader_context = Some(leader_context);
    }

    pub(crate) fn on_new_entries(
        &mut self,
        prev_log_index: Option<Index>,
        prev_log_term: Term,
        entries: &[RaftLogEntry],
        leader_context: LeaderContext,
    ) {
        if self.mode == Mode::Pipeline && !entries.is_empty() && Some(self.last_sent_index) <= prev_log_index {
            let lag = entries_between(self.match_index, prev_log_index);
            if lag <= self.config.options.max_allowed_shipping_lag {
                self.send_new_entries(prev_log_index, prev_log_term, entries, leader_context);
            } else {
                slog::info!(self.logger, "Shipping lag {} too large, moving to CATCHUP. {}", lag, self.status());
                self.mode = Mode::Catchup;
            }
        }

        self.last_leader_context = Some(leader_context);
    }

    pub(crate) fn on_commit_update(&mut self, leader_context: LeaderContext) {
        if self.mode == Mode::Pipeline {
            self.send_commit_update(leader_context);
        }

        self.last_leader_context = Some(leader_context);
    }

    pub(crate) fn on_retry_timeout(&mut self, wake_time: Instant) {
        if self.timeout_deadline != Some(wake_time) {
            slog::debug!(self.logger, "Ignoring stale retry timeout. {}", self.status());
            return;
        }
        self.timeout_deadline = None;

        if self.mode == Mode::Pipeline {
            slog::info!(self.logger, "Timed out, moving to CATCHUP. {}", self.status());
            self.mode = Mode::Catchup;
        }

        if let Some(leader_context) = self.last_leader_context {
            self.send_single(Some(self.last_sent_index), leader_context);
        }
    }

    /// Ships the batch following the match index. Returns true if the follower is (or will be,
    /// once this batch lands) at the end of the log.
    fn send_next_batch_after_match(&mut self, leader_context: LeaderContext) -> bool {
        match self.config.raft_log.append_index() {
            Some(append_index) if Some(append_index) > self.match_index => {
                let start = Index::after(self.match_index);
                // Saturates, so a batch size meaning "unlimited" can't overflow.
                let batch_end = start
                    .as_u64()
                    .saturating_add(self.config.options.catchup_batch_size - 1);
                let end = append_index.min(Index::new(batch_end));
                self.send_range(start, end, leader_context);

                end == append_index
            }
            _ => true,
        }
    }

    fn send_single(&mut self, index: Option<Index>, leader_context: LeaderContext) {
        self.schedule_timeout();

        let first_retained = Index::after(self.config.raft_log.prev_index());
        let index = index.map_or(first_retained, |index| index.max(first_retained));
        self.last_sent_index = index;

        if let Err(e) = self.try_send_single(index, leader_context) {
            slog::warn!(self.logger, "Failed to send entry {:?}: {}. {}", index, e, self.status());
        }
    }

    fn try_send_single(&self, index: Index, leader_context: LeaderContext) -> Result<(), ShipError> {
        let prev_log_index = index.checked_minus(1);
        let prev_log_term = match self.read_prev_log_term(prev_log_index)? {
            Some(prev_log_term) => prev_log_term,
            None => {
                self.on_entries_unavailable(prev_log_index, leader_context);
                return Ok(());
            }
        };
        if prev_log_term > leader_context.term {
            self.warn_superseded(prev_log_term);
            return Ok(());
        }

        let mut reader = EntryReader::new(&*self.config.raft_log, &*self.config.in_flight);
        let entries = match reader
            .read(index)
            .map_err(|source| ShipError::LogRead { index, source })?
        {
            Some(entry) if entry.term > leader_context.term => {
                self.warn_superseded(entry.term);
                return Ok(());
            }
            Some(entry) => vec![entry],
            // Pure probe.
            None => vec![],
        };

        self.send_append_entries(prev_log_index, prev_log_term, entries, leader_context);
        Ok(())
    }

    fn send_range(&mut self, start: Index, end: Index, leader_context: LeaderContext) {
        if start > end {
            return;
        }

        self.last_sent_index = end;
        if let Err(e) = self.try_send_range(start, end, leader_context) {
            slog::warn!(self.logger, "Failed to send entries [{:?}, {:?}]: {}. {}", start, end, e, self.status());
        }
        self.schedule_timeout();
    }

    fn try_send_range(&self, start: Index, end: Index, leader_context: LeaderContext) -> Result<(), ShipError> {
        let batch_size = (end.as_u64() - start.as_u64() + 1) as usize;
        let prev_log_index = start.checked_minus(1);
        let prev_log_term = self.read_prev_log_term(prev_log_index)?;
        if let Some(prev_log_term) = prev_log_term {
            if prev_log_term > leader_context.term {
                self.warn_superseded(prev_log_term);
                return Ok(());
            }
        }

        let mut reader = EntryReader::new(&*self.config.raft_log, &*self.config.in_flight);
        let mut entries = Vec::with_capacity(batch_size);
        let mut entry_missing = false;
        let mut index = start;
        while index <= end {
            match reader
                .read(index)
                .map_err(|source| ShipError::LogRead { index, source })?
            {
                Some(entry) if entry.term > leader_context.term => {
                    self.warn_superseded(entry.term);
                    return Ok(());
                }
                Some(entry) => entries.push(entry),
                None => {
                    entry_missing = true;
                    break;
                }
            }
            index = index.plus(1);
        }

        match prev_log_term {
            Some(prev_log_term) if !entry_missing => {
                self.send_append_entries(prev_log_index, prev_log_term, entries, leader_context);
            }
            _ => self.on_entries_unavailable(prev_log_index, leader_context),
        }
        Ok(())
    }

    fn send_new_entries(
        &mut self,
        prev_log_index: Option<Index>,
        prev_log_term: Term,
        entries: &[RaftLogEntry],
        leader_context: LeaderContext,
    ) {
        if prev_log_term > leader_context.term {
            self.warn_superseded(prev_log_term);
            return;
        }

        self.schedule_timeout();
        self.last_sent_index = Index::after(prev_log_index).plus(entries.len() as u64 - 1);
        self.send_append_entries(prev_log_index, prev_log_term, entries.to_vec(), leader_context);
    }

    // Any committed entry was committed in the current term (leader completeness), so the
    // commit index's term is the leader's term.
    fn send_commit_update(&self, leader_context: LeaderContext) {
        let heartbeat = Heartbeat {
            leader_id: self.config.leader.clone(),
            term: leader_context.term,
            leader_commit_index: leader_context.commit_index,
            commit_index_term: leader_context.term,
            log_identity: self.config.log_identity.clone(),
        };
        self.config
            .outbound
            .send(&self.follower, RaftMessage::Heartbeat(heartbeat));
    }

    fn send_append_entries(
        &self,
        prev_log_index: Option<Index>,
        prev_log_term: Term,
        entries: Vec<RaftLogEntry>,
        leader_context: LeaderContext,
    ) {
        slog::debug!(
            self.logger,
            "AppendEntries prev_log_index={:?} entries={}. {}",
            prev_log_index,
            entries.len(),
            self.status()
        );

        let request = AppendEntriesRequest {
            leader_id: self.config.leader.clone(),
            term: leader_context.term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit_index: leader_context.commit_index,
            log_identity: self.config.log_identity.clone(),
        };
        self.config
            .outbound
            .send(&self.follower, RaftMessage::AppendEntries(request));
    }

    /// Entries the follower needs are gone. If that's because the log was pruned past them, the
    /// follower has to catch up some other way and we tell it so.
    fn on_entries_unavailable(&self, prev_log_index: Option<Index>, leader_context: LeaderContext) {
        match self.config.raft_log.prev_index() {
            Some(compacted_prev_index) if Some(compacted_prev_index) >= prev_log_index => {
                slog::info!(
                    self.logger,
                    "Entries after {:?} were pruned, sending compaction info. {}",
                    prev_log_index,
                    self.status()
                );
                let info = LogCompactionInfo {
                    leader_id: self.config.leader.clone(),
                    term: leader_context.term,
                    compacted_prev_index,
                    log_identity: self.config.log_identity.clone(),
                };
                self.config
                    .outbound
                    .send(&self.follower, RaftMessage::LogCompactionInfo(info));
            }
            _ => slog::error!(
                self.logger,
                "Could not send compaction info and entries were missing, but log is not behind. {}",
                self.status()
            ),
        }
    }

    // The predecessor of the very first entry always exists, with term 0.
    fn read_prev_log_term(&self, prev_log_index: Option<Index>) -> Result<Option<Term>, ShipError> {
        match prev_log_index {
            None => Ok(Some(Term::new(0))),
            Some(index) => self
                .config
                .raft_log
                .read_entry_term(index)
                .map_err(|source| ShipError::LogRead { index, source }),
        }
    }

    fn warn_superseded(&self, term: Term) {
        slog::warn!(
            self.logger,
            "Aborting send. Not leader anymore? {}, term={:?}",
            self.status(),
            term
        );
    }

    fn schedule_timeout(&mut self) {
        let deadline = self.config.clock.now() + self.config.options.retry_interval;
        self.timeout_deadline = Some(deadline);
        if let Some(retry_timer) = &self.retry_timer {
            retry_timer.arm(deadline);
        }
    }

    fn abort_timeout(&mut self) {
        self.timeout_deadline = None;
        if let Some(retry_timer) = &self.retry_timer {
            retry_timer.disarm();
        }
    }

    fn status(&self) -> String {
        format!(
            "mode={:?} match_index={:?} last_sent_index={:?}",
            self.mode, self.match_index, self.last_sent_index
        )
    }
}

// Number of entries in `(from, to]`. `None` sits right before index 0.
fn entries_between(from: Option<Index>, to: Option<Index>) -> u64 {
    let position = |index: Option<Index>| index.map_or(0, |index| index.as_u64() + 1);
    position(to).saturating_sub(position(from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ReplicaId;
    use crate::commitlog::{InMemoryInFlightCache, InMemoryRaftLog};
    use crate::shipping::messages::ChannelOutbound;
    use crate::shipping::timers::{mocked_clock, MockClock, MockClockController};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    const RETRY_INTERVAL: Duration = Duration::from_millis(100);

    struct Fixture {
        log: Arc<InMemoryRaftLog>,
        in_flight: Arc<InMemoryInFlightCache>,
        outbound_rx: mpsc::UnboundedReceiver<(ReplicaId, RaftMessage<ReplicaId>)>,
        clock_controller: MockClockController,
        shipper: RaftLogShipper<ReplicaId, MockClock>,
    }

    impl Fixture {
        fn new(catchup_batch_size: u64, max_allowed_shipping_lag: u64) -> Self {
            let log = Arc::new(InMemoryRaftLog::new());
            let in_flight = Arc::new(InMemoryInFlightCache::new(16));
            let (outbound, outbound_rx) = ChannelOutbound::new();
            let (clock, clock_controller) = mocked_clock();

            let config = ShipperConfig {
                leader: ReplicaId::new("leader"),
                log_identity: LogIdentity::new("test-log"),
                raft_log: log.clone(),
                in_flight: in_flight.clone(),
                outbound: Arc::new(outbound),
                clock,
                options: ShippingOptionsValidated {
                    retry_interval: RETRY_INTERVAL,
                    catchup_batch_size,
                    max_allowed_shipping_lag,
                    },
            };
            let logger = slog::Logger::root(slog::Discard, slog::o!());
            let shipper = RaftLogShipper::new(&logger, ReplicaId::new("follower"), config);

            Fixture {
                log,
                in_flight,
                outbound_rx,
                clock_controller,
                shipper,
            }
        }

        /// Entries at indices `0..=last`, all in `term`.
        fn with_entries(self, last: u64, term: u64) -> Self {
            for i in 0..=last {
                self.log.append(RaftLogEntry::new(Term::new(term), format!("entry-{}", i)));
            }
            self
        }

        fn start(&mut self, leader_context: LeaderContext) {
            // Outside a runtime, so this is the "no timer" path; deadlines are still tracked.
            let no_runtime = tokio::runtime::Handle::try_current().unwrap_err();
            self.shipper
                .start(leader_context, Err(TimerStartError::from(no_runtime)));
        }

        fn append(&self, term: u64) -> (Option<Index>, Term, RaftLogEntry) {
            let prev_log_index = self.log.append_index();
            let prev_log_term = match prev_log_index {
                Some(index) => self.log.read_entry_term(index).unwrap().unwrap(),
                None => Term::new(0),
            };
            let entry = RaftLogEntry::new(Term::new(term), "new");
            self.log.append(entry.clone());
            (prev_log_index, prev_log_term, entry)
        }

        fn sent(&mut self) -> Vec<RaftMessage<ReplicaId>> {
            let mut sent = Vec::new();
            while let Ok((to, message)) = self.outbound_rx.try_recv() {
                assert_eq!(to, ReplicaId::new("follower"));
                sent.push(message);
            }
            sent
        }

        fn single_append(&mut self) -> AppendEntriesRequest<ReplicaId> {
            let mut sent = self.sent();
            assert_eq!(sent.len(), 1, "Expected exactly one message: {:?}", sent);
            match sent.remove(0) {
                RaftMessage::AppendEntries(request) => request,
                other => panic!("Expected AppendEntries, got {:?}", other),
            }
        }
    }

    fn idx(i: u64) -> Index {
        Index::new(i)
    }

    fn ctx(term: u64) -> LeaderContext {
        LeaderContext::new(Term::new(term), Some(idx(0)))
    }

    #[test]
    fn walkthrough_probe_catchup_pipeline() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);

        // 1. Fresh shipper probes at the append index.
        f.start(ctx(1));
        let probe = f.single_append();
        assert_eq!(probe.prev_log_index, Some(idx(9)));
        assert_eq!(probe.prev_log_term, Term::new(1));
        assert_eq!(probe.entries.len(), 1);
        assert_eq!(probe.entries[0].data, "entry-10");
        assert_eq!(probe.leader_commit_index, Some(idx(0)));
        assert_eq!(probe.log_identity, LogIdentity::new("test-log"));
        assert_eq!(f.shipper.mode, Mode::Mismatch);
        assert_eq!(f.shipper.last_sent_index, idx(10));

        // 2. Follower has only index 0: probe there.
        f.shipper.on_mismatch(Some(idx(0)), ctx(1));
        let probe = f.single_append();
        assert_eq!(probe.prev_log_index, None);
        assert_eq!(probe.prev_log_term, Term::new(0));
        assert_eq!(probe.entries[0].data, "entry-0");
        assert_eq!(f.shipper.last_sent_index, idx(0));
        assert_eq!(f.shipper.mode, Mode::Mismatch);

        // 3. Match at 0 starts catch up with [1, 3].
        f.shipper.on_match(Some(idx(0)), ctx(1));
        let batch = f.single_append();
        assert_eq!(batch.prev_log_index, Some(idx(0)));
        assert_eq!(batch.entries.len(), 3);
        assert_eq!(batch.entries[0].data, "entry-1");
        assert_eq!(batch.entries[2].data, "entry-3");
        assert_eq!(f.shipper.mode, Mode::Catchup);

        // 4. Match at 3 ships [4, 6].
        f.shipper.on_match(Some(idx(3)), ctx(1));
        let batch = f.single_append();
        assert_eq!(batch.prev_log_index, Some(idx(3)));
        assert_eq!(batch.entries.len(), 3);
        assert_eq!(f.shipper.last_sent_index, idx(6));
        assert_eq!(f.shipper.mode, Mode::Catchup);

        // Then [7, 9], then the final [10, 10] which reaches the end of the log.
        f.shipper.on_match(Some(idx(6)), ctx(1));
        assert_eq!(f.single_append().entries.len(), 3);
        assert_eq!(f.shipper.mode, Mode::Catchup);
        f.shipper.on_match(Some(idx(9)), ctx(1));
        let batch = f.single_append();
        assert_eq!(batch.prev_log_index, Some(idx(9)));
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(f.shipper.mode, Mode::Pipeline);
        assert!(f.shipper.timeout_deadline.is_some());

        // 5. Fully acked: timer cancelled, nothing else to send.
        f.shipper.on_match(Some(idx(10)), ctx(1));
        assert!(f.sent().is_empty());
        assert_eq!(f.shipper.mode, Mode::Pipeline);
        assert_eq!(f.shipper.timeout_deadline, None);

        // 6. New entry 11 ships right away.
        let (prev_log_index, prev_log_term, entry) = f.append(1);
        f.shipper
            .on_new_entries(prev_log_index, prev_log_term, &[entry.clone()], ctx(1));
        let request = f.single_append();
        assert_eq!(request.prev_log_index, Some(idx(10)));
        assert_eq!(request.entries, vec![entry]);
        assert_eq!(f.shipper.last_sent_index, idx(11));
        assert!(f.shipper.timeout_deadline.is_some());
    }

    #[test]
    fn unlimited_batch_size_ships_rest_of_log() {
        let mut f = Fixture::new(u64::MAX, 5).with_entries(10, 1);
        f.start(ctx(1));
        f.shipper.on_mismatch(Some(idx(3)), ctx(1));
        f.sent();

        f.shipper.on_match(Some(idx(3)), ctx(1));

        let batch = f.single_append();
        assert_eq!(batch.prev_log_index, Some(idx(3)));
        assert_eq!(batch.entries.len(), 7);
        assert_eq!(f.shipper.last_sent_index, idx(10));
        assert_eq!(f.shipper.mode, Mode::Pipeline);
    }

    #[test]
    fn pipeline_downgrades_when_lag_too_large() {
        let mut f = Fixture::new(3, 5).with_entries(5, 1);
        f.start(ctx(1));
        f.shipper.on_match(Some(idx(5)), ctx(1));
        assert_eq!(f.shipper.mode, Mode::Pipeline);
        f.sent();

        // Entries 6..=12 in one append: lag at send time is 0.
        let entries: Vec<_> = (6..=12)
            .map(|i| RaftLogEntry::new(Term::new(1), format!("entry-{}", i)))
            .collect();
        for entry in &entries {
            f.log.append(entry.clone());
        }
        f.shipper
            .on_new_entries(Some(idx(5)), Term::new(1), &entries, ctx(1));
        assert_eq!(f.single_append().entries.len(), 7);
        assert_eq!(f.shipper.last_sent_index, idx(12));

        // Match still at 5 while prev_log_index reached 12: 7 > 5.
        let (prev_log_index, prev_log_term, entry) = f.append(1);
        f.shipper
            .on_new_entries(prev_log_index, prev_log_term, &[entry], ctx(1));
        assert!(f.sent().is_empty());
        assert_eq!(f.shipper.mode, Mode::Catchup);

        // Catch up resumes once the follower has everything we sent.
        f.shipper.on_match(Some(idx(12)), ctx(1));
        let batch = f.single_append();
        assert_eq!(batch.prev_log_index, Some(idx(12)));
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(f.shipper.mode, Mode::Pipeline);
    }

    #[test]
    fn new_entries_ignored_unless_pipelining() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);
        f.start(ctx(1));
        f.sent();

        let (prev_log_index, prev_log_term, entry) = f.append(1);
        f.shipper
            .on_new_entries(prev_log_index, prev_log_term, &[entry], ctx(2));

        assert!(f.sent().is_empty());
        assert_eq!(f.shipper.mode, Mode::Mismatch);
        assert_eq!(f.shipper.last_leader_context, Some(ctx(2)));
    }

    #[test]
    fn empty_log() {
        let mut f = Fixture::new(3, 5);

        f.start(ctx(1));
        let probe = f.single_append();
        assert_eq!(probe.prev_log_index, None);
        assert!(probe.entries.is_empty());
        assert_eq!(f.shipper.last_sent_index, idx(0));

        // Follower is empty too: nothing to ship.
        f.shipper.on_match(None, ctx(1));
        assert!(f.sent().is_empty());
        assert_eq!(f.shipper.mode, Mode::Pipeline);

        // The very first entry can't be pipelined (last_sent_index is already 0), but the retry
        // timer picks it up.
        let (prev_log_index, prev_log_term, entry) = f.append(1);
        f.shipper
            .on_new_entries(prev_log_index, prev_log_term, &[entry.clone()], ctx(1));
        assert!(f.sent().is_empty());

        let deadline = f.shipper.timeout_deadline.unwrap();
        f.shipper.on_retry_timeout(deadline);
        let request = f.single_append();
        assert_eq!(request.prev_log_index, None);
        assert_eq!(request.entries, vec![entry]);
        assert_eq!(f.shipper.mode, Mode::Catchup);
    }

    #[test]
    fn mismatch_probe_never_overshoots_last_sent() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);
        f.start(ctx(1));
        f.sent();

        f.shipper.on_mismatch(Some(idx(50)), ctx(1));
        assert_eq!(f.single_append().prev_log_index, Some(idx(8)));
        assert_eq!(f.shipper.last_sent_index, idx(9));

        // Follower's log is empty.
        f.shipper.on_mismatch(None, ctx(1));
        assert_eq!(f.single_append().prev_log_index, None);
        assert_eq!(f.shipper.last_sent_index, idx(0));

        // Already at the bottom.
        f.shipper.on_mismatch(None, ctx(1));
        assert_eq!(f.shipper.last_sent_index, idx(0));
    }

    #[test]
    fn mismatch_while_catching_up_resends_last_sent() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);
        f.start(ctx(1));
        f.shipper.on_mismatch(Some(idx(0)), ctx(1));
        f.shipper.on_match(Some(idx(0)), ctx(1));
        assert_eq!(f.shipper.mode, Mode::Catchup);
        f.sent();

        f.shipper.on_mismatch(Some(idx(1)), ctx(1));

        let probe = f.single_append();
        assert_eq!(probe.prev_log_index, Some(idx(2)));
        assert_eq!(probe.entries[0].data, "entry-3");
        assert_eq!(f.shipper.mode, Mode::Mismatch);
    }

    #[test]
    fn probe_is_clamped_to_retained_entries() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);
        f.start(ctx(1));
        f.sent();
        f.log.prune(idx(4));

        f.shipper.on_mismatch(Some(idx(0)), ctx(1));

        let probe = f.single_append();
        assert_eq!(probe.prev_log_index, Some(idx(4)));
        assert_eq!(probe.prev_log_term, Term::new(1));
        assert_eq!(probe.entries[0].data, "entry-5");
        assert_eq!(f.shipper.last_sent_index, idx(5));
    }

    #[test]
    fn pruned_batch_sends_compaction_info() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);
        f.start(ctx(1));
        f.shipper.on_mismatch(Some(idx(0)), ctx(1));
        f.sent();
        f.log.prune(idx(5));

        f.shipper.on_match(Some(idx(0)), ctx(1));

        match f.sent().as_slice() {
            [RaftMessage::LogCompactionInfo(info)] => {
                assert_eq!(info.compacted_prev_index, idx(5));
                assert_eq!(info.term, Term::new(1));
                assert_eq!(info.leader_id, ReplicaId::new("leader"));
            }
            other => panic!("Expected compaction info, got {:?}", other),
        }
        assert_eq!(f.shipper.last_sent_index, idx(3));
        assert!(f.shipper.timeout_deadline.is_some());
    }

    #[test]
    fn range_beyond_log_end_sends_nothing() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);
        f.start(ctx(1));
        f.sent();

        // Entries are missing, but not because the log was pruned.
        f.shipper.send_range(idx(11), idx(12), ctx(1));

        assert!(f.sent().is_empty());
        assert_eq!(f.shipper.last_sent_index, idx(12));
        assert!(f.shipper.timeout_deadline.is_some());
    }

    #[test]
    fn superseded_leader_abandons_send() {
        let mut f = Fixture::new(3, 5).with_entries(4, 1);
        f.log.append(RaftLogEntry::new(Term::new(3), "from-new-leader"));
        f.log.append(RaftLogEntry::new(Term::new(3), "from-new-leader"));

        // Probe at 6 has a predecessor from term 3.
        f.start(ctx(1));
        assert!(f.sent().is_empty());
        assert_eq!(f.shipper.last_sent_index, idx(6));
        assert!(f.shipper.timeout_deadline.is_some());

        // Probe at 3 is fine.
        f.shipper.on_mismatch(Some(idx(3)), ctx(1));
        assert_eq!(f.single_append().entries.len(), 1);

        // Batch [4, 6] runs into term 3 and is dropped whole.
        f.shipper.on_match(Some(idx(3)), ctx(1));
        assert!(f.sent().is_empty());

        // Pipelined entries with a newer predecessor term are dropped too.
        f.shipper.mode = Mode::Pipeline;
        f.shipper.on_new_entries(Some(idx(6)), Term::new(3), &[RaftLogEntry::new(Term::new(3), "x")], ctx(1));
        assert!(f.sent().is_empty());
    }

    #[test]
    fn in_flight_cache_preferred_over_log() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);
        f.in_flight
            .put(idx(10), RaftLogEntry::new(Term::new(1), "cached-10"));

        f.start(ctx(1));

        assert_eq!(f.single_append().entries[0].data, "cached-10");
    }

    #[test]
    fn commit_update_only_when_pipelining() {
        let mut f = Fixture::new(3, 5).with_entries(2, 1);
        f.start(ctx(1));
        f.sent();

        f.shipper.on_commit_update(ctx(1));
        assert!(f.sent().is_empty());

        f.shipper.on_match(Some(idx(2)), ctx(1));
        assert_eq!(f.shipper.mode, Mode::Pipeline);
        let commit = LeaderContext::new(Term::new(4), Some(idx(2)));
        f.shipper.on_commit_update(commit);

        match f.sent().as_slice() {
            [RaftMessage::Heartbeat(heartbeat)] => {
                assert_eq!(heartbeat.term, Term::new(4));
                assert_eq!(heartbeat.leader_commit_index, Some(idx(2)));
                assert_eq!(heartbeat.commit_index_term, Term::new(4));
            }
            other => panic!("Expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn retry_timeout() {
        let mut f = Fixture::new(1, 5).with_entries(5, 1);
        f.start(ctx(1));
        f.shipper.on_match(Some(idx(3)), ctx(1));
        assert_eq!(f.shipper.mode, Mode::Catchup);
        f.sent();
        let stale_deadline = f.shipper.timeout_deadline.unwrap();

        // Rescheduled since.
        f.clock_controller.advance(RETRY_INTERVAL / 2);
        f.shipper.on_mismatch(Some(idx(5)), ctx(1));
        f.sent();
        f.shipper.on_retry_timeout(stale_deadline);
        assert!(f.sent().is_empty());

        // Current deadline resends at last_sent_index with the last seen leader context.
        let deadline = f.shipper.timeout_deadline.unwrap();
        assert_eq!(deadline, f.clock_controller.current_time() + RETRY_INTERVAL);
        f.shipper.on_commit_update(ctx(2));
        f.clock_controller.advance(RETRY_INTERVAL);
        f.shipper.on_retry_timeout(deadline);

        let resend = f.single_append();
        assert_eq!(resend.term, Term::new(2));
        assert_eq!(resend.prev_log_index, Some(idx(3)));
        assert_eq!(f.shipper.mode, Mode::Mismatch);
        assert_eq!(
            f.shipper.timeout_deadline,
            Some(f.clock_controller.current_time() + RETRY_INTERVAL)
        );
    }

    #[test]
    fn retry_timeout_downgrades_pipeline() {
        let mut f = Fixture::new(3, 5).with_entries(5, 1);
        f.start(ctx(1));
        f.shipper.on_match(Some(idx(4)), ctx(1));
        assert_eq!(f.shipper.mode, Mode::Pipeline);
        f.sent();

        let deadline = f.shipper.timeout_deadline.unwrap();
        f.shipper.on_retry_timeout(deadline);

        assert_eq!(f.shipper.mode, Mode::Catchup);
        assert_eq!(f.single_append().prev_log_index, Some(idx(4)));
    }

    #[test]
    fn match_index_never_decreases() {
        let mut f = Fixture::new(3, 5).with_entries(10, 1);
        f.start(ctx(1));
        f.shipper.on_match(Some(idx(6)), ctx(1));
        f.sent();

        f.shipper.on_match(Some(idx(2)), ctx(1));
        f.shipper.on_match(None, ctx(1));

        assert_eq!(f.shipper.match_index, Some(idx(6)));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut f = Fixture::new(3, 5).with_entries(3, 1);
        f.start(ctx(1));
        assert!(f.shipper.timeout_deadline.is_some());

        f.shipper.stop();
        assert_eq!(f.shipper.timeout_deadline, None);
        f.shipper.stop();
        assert_eq!(f.shipper.timeout_deadline, None);
    }

    #[test]
    fn entries_between_counts_positions() {
        assert_eq!(entries_between(Some(idx(10)), Some(idx(10))), 0);
        assert_eq!(entries_between(Some(idx(5)), Some(idx(12))), 7);
        assert_eq!(entries_between(None, Some(idx(3))), 4);
        assert_eq!(entries_between(None, None), 0);
        assert_eq!(entries_between(Some(idx(4)), Some(idx(2))), 0);
    }

    /// Drives shippers with random event sequences and checks what must hold regardless.
    #[test]
    fn random_events_keep_invariants() {
        const BATCH: u64 = 4;
        const MAX_LAG: u64 = 6;
        const TERM: u64 = 2;

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut f = Fixture::new(BATCH, MAX_LAG).with_entries(rng.gen_range(0..30), TERM);
            f.start(ctx(TERM));

            for _ in 0..300 {
                let match_before = f.shipper.match_index;
                let mut pipelined = false;

                match rng.gen_range(0..5) {
                    0 => {
                        let prev_log_index = f.log.append_index();
                        let prev_log_term = match prev_log_index {
                            Some(index) => f.log.read_entry_term(index).unwrap().unwrap(),
                            None => Term::new(0),
                        };
                        let entries: Vec<_> = (0..rng.gen_range(1..=BATCH))
                            .map(|_| RaftLogEntry::new(Term::new(TERM), "random"))
                            .collect();
                        for entry in &entries {
                            f.log.append(entry.clone());
                        }
                        pipelined = f.shipper.mode == Mode::Pipeline;
                        f.shipper
                            .on_new_entries(prev_log_index, prev_log_term, &entries, ctx(TERM));
                    }
                    1 => {
                        let upper = f.shipper.last_sent_index.as_u64() + 1;
                        let reported = rng.gen_range(0..=upper);
                        let new_match_index = reported.checked_sub(1).map(Index::new);
                        f.shipper.on_match(new_match_index, ctx(TERM));
                    }
                    2 => {
                        let upper = Index::after(f.log.append_index()).as_u64();
                        let reported = rng.gen_range(0..=upper);
                        let last_remote_append_index = reported.checked_sub(1).map(Index::new);
                        f.shipper.on_mismatch(last_remote_append_index, ctx(TERM));
                    }
                    3 => f.shipper.on_commit_update(ctx(TERM)),
                    _ => {
                        if let Some(deadline) = f.shipper.timeout_deadline {
                            f.shipper.on_retry_timeout(deadline);
                        }
                    }
                }

                assert!(f.shipper.match_index >= match_before, "seed {}", seed);
                for message in f.sent() {
                    if let RaftMessage::AppendEntries(request) = message {
                        assert!(request.entries.len() as u64 <= BATCH, "seed {}", seed);
                        assert!(request.prev_log_term <= Term::new(TERM), "seed {}", seed);
                        if pipelined {
                            assert!(
                                entries_between(match_before, request.prev_log_index) <= MAX_LAG,
                                "seed {}",
                                seed
                            );
                        }
                    }
                }
            }
        }
    }
}
