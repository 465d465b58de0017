use crate::commitlog::{InFlightCache, Index, LogCursor, RaftLogEntry, ReadableRaftLog};
use std::io;

/// Reads entries for one send. Recently appended entries come from the in-flight cache; the log is
/// only touched on a miss, and the cursor is kept open for as long as reads stay consecutive.
pub(crate) struct EntryReader<'a> {
    raft_log: &'a dyn ReadableRaftLog,
    in_flight: &'a dyn InFlightCache,
    // Cursor along with the index it will yield next.
    cursor: Option<(Index, LogCursor<'a>)>,
}

impl<'a> EntryReader<'a> {
    pub(crate) fn new(raft_log: &'a dyn ReadableRaftLog, in_flight: &'a dyn InFlightCache) -> Self {
        EntryReader {
            raft_log,
            in_flight,
            cursor: None,
        }
    }

    /// Returns `Ok(None)` if the log does not hold `index` (pruned, or beyond its end).
    pub(crate) fn read(&mut self, index: Index) -> Result<Option<RaftLogEntry>, io::Error> {
        if let Some(entry) = self.in_flight.retrieve(index) {
            return Ok(Some(entry));
        }

        let mut cursor = match self.cursor.take() {
            Some((next, cursor)) if next == index => cursor,
            _ => self.raft_log.cursor(index)?,
        };

        match cursor.next() {
            Some(Ok(entry)) => {
                self.cursor = Some((index.plus(1), cursor));
                Ok(Some(entry))
            }
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}
