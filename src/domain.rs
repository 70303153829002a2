use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    counter::{Counter, FollowerCounterRule},
    log_store::{LogFile, LogRecord, LogStoreError},
};

/// A provisional proposal, subject to rollback until its order commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLogEntry {
    #[serde(rename = "raft_index")]
    pub index: u64,
    #[serde(rename = "raft_term")]
    pub term: u64,
    pub product_name: String,
    pub quantity: u32,
}

impl LogRecord for RaftLogEntry {
    const KIND: &'static str = "raft";

    fn key(&self) -> u64 {
        self.index
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&(self.index, self.term, &self.product_name, self.quantity))
    }

    fn decode(line: &str) -> Result<Self, serde_json::Error> {
        let (index, term, product_name, quantity): (u64, u64, String, u32) =
            serde_json::from_str(line)?;
        Ok(Self {
            index,
            term,
            product_name,
            quantity,
        })
    }
}

/// A committed order. Never removed once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLogEntry {
    pub order_number: u64,
    pub product_name: String,
    pub quantity: u32,
}

impl LogRecord for OrderLogEntry {
    const KIND: &'static str = "order";

    fn key(&self) -> u64 {
        self.order_number
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&(self.order_number, &self.product_name, self.quantity))
    }

    fn decode(line: &str) -> Result<Self, serde_json::Error> {
        let (order_number, product_name, quantity): (u64, String, u32) =
            serde_json::from_str(line)?;
        Ok(Self {
            order_number,
            product_name,
            quantity,
        })
    }
}

/// Answer to "what am I missing after my latest key?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUp<R> {
    UpToDate,
    Behind(Vec<R>),
}

/// Read-only view of one log, as printed by `order-replica status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub kind: &'static str,
    pub path: String,
    pub records: usize,
    pub latest: Option<u64>,
    pub next: u64,
}

/// One log file plus the counter that numbers it.
///
/// This is the unit of mutual exclusion: callers keep a `LogDomain` behind a mutex so that
/// issuing a key and appending its record are atomic.
#[derive(Debug)]
pub struct LogDomain<R> {
    store: LogFile<R>,
    counter: Counter,
}

impl<R: LogRecord> LogDomain<R> {
    pub fn open(store: LogFile<R>) -> Result<Self, LogStoreError> {
        let counter = Counter::from_last_key(store.last_key()?);
        debug!(
            kind = R::KIND,
            path = %store.path().display(),
            next = counter.next(),
            "log loaded"
        );
        Ok(Self { store, counter })
    }

    pub fn store(&self) -> &LogFile<R> {
        &self.store
    }

    pub fn counter(&self) -> Counter {
        self.counter
    }

    pub fn latest(&self) -> u64 {
        self.counter.latest()
    }

    pub fn last_issued(&self) -> Option<u64> {
        self.counter.last_issued()
    }

    /// Issues the next key and appends the record built from it.
    ///
    /// The key stays consumed if the append fails, so it is never handed out twice.
    pub fn append_next(&mut self, build: impl FnOnce(u64) -> R) -> Result<R, LogStoreError> {
        let key = self
            .counter
            .issue()
            .ok_or(LogStoreError::Exhausted { kind: R::KIND })?;
        let record = build(key);
        self.store.append(&record)?;
        Ok(record)
    }

    /// Follower side of replication: append, then move the counter past the received key.
    pub fn accept_replicated(
        &mut self,
        record: &R,
        rule: FollowerCounterRule,
    ) -> Result<(), LogStoreError> {
        if record.key() == u64::MAX {
            return Err(LogStoreError::KeyOutOfRange {
                kind: R::KIND,
                key: record.key(),
            });
        }
        self.store.append(record)?;
        self.counter.observe_replicated(record.key(), rule);
        Ok(())
    }

    /// Removes the tail record matching an invalidation of `n` and steps the counter back when
    /// `n` is the next value to issue.
    pub fn invalidate(&mut self, n: u64) -> Result<Option<R>, LogStoreError> {
        let removed = self.store.remove_last_matching(n)?;
        self.counter.rollback_if_next(n);
        Ok(removed)
    }

    pub fn find(&self, key: u64) -> Result<Option<R>, LogStoreError> {
        self.store.find(key)
    }

    pub fn read_all(&self) -> Result<Vec<R>, LogStoreError> {
        self.store.read_all()
    }

    pub fn summary(&self) -> Result<LogSummary, LogStoreError> {
        Ok(LogSummary {
            kind: R::KIND,
            path: self.store.path().display().to_string(),
            records: self.store.read_all()?.len(),
            latest: self.counter.last_issued(),
            next: self.counter.next(),
        })
    }

    /// `requester_latest` is `None` when the requester's log is empty.
    pub fn missing_after(&self, requester_latest: Option<u64>) -> Result<CatchUp<R>, LogStoreError> {
        match (requester_latest, self.counter.last_issued()) {
            (_, None) => Ok(CatchUp::UpToDate),
            (None, Some(_)) => Ok(CatchUp::Behind(self.store.read_all()?)),
            (Some(theirs), Some(ours)) if theirs < ours => {
                Ok(CatchUp::Behind(self.store.find_from(theirs)?))
            }
            (Some(_), Some(_)) => Ok(CatchUp::UpToDate),
        }
    }

    /// Appends catch-up records, re-sorts the file and reloads the counter from it.
    pub fn merge_missing(&mut self, records: &[R]) -> Result<(), LogStoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.store.append_all(records)?;
        self.store.rewrite_sorted()?;
        self.counter = Counter::from_last_key(self.store.last_key()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn order(number: u64) -> OrderLogEntry {
        OrderLogEntry {
            order_number: number,
            product_name: "Tux".to_string(),
            quantity: 1,
        }
    }

    fn open_orders(dir: &std::path::Path) -> LogDomain<OrderLogEntry> {
        LogDomain::open(LogFile::open(dir.join("order.jsonl")).unwrap()).unwrap()
    }

    #[test]
    fn raft_entry_wire_names_and_record_layout() {
        let entry = RaftLogEntry {
            index: 4,
            term: 2,
            product_name: "Whale".to_string(),
            quantity: 3,
        };
        let wire = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "raft_index": 4,
                "raft_term": 2,
                "product_name": "Whale",
                "quantity": 3
            })
        );
        assert_eq!(entry.encode().unwrap(), "[4,2,\"Whale\",3]");
        assert_eq!(RaftLogEntry::decode("[4,2,\"Whale\",3]").unwrap(), entry);
    }

    #[test]
    fn counter_tracks_appends_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut orders = open_orders(tmp.path());
            for expected in 0..3 {
                let entry = orders.append_next(order).unwrap();
                assert_eq!(entry.order_number, expected);
            }
            assert_eq!(orders.latest(), 2);
        }
        let orders = open_orders(tmp.path());
        assert_eq!(orders.counter().next(), 3);
    }

    #[test]
    fn replicated_max_key_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut orders = open_orders(tmp.path());
        orders
            .accept_replicated(&order(u64::MAX - 2), FollowerCounterRule::Overwrite)
            .unwrap();

        let err = orders
            .accept_replicated(&order(u64::MAX), FollowerCounterRule::Overwrite)
            .unwrap_err();
        assert!(matches!(err, LogStoreError::KeyOutOfRange { key: u64::MAX, .. }));
        assert_eq!(orders.read_all().unwrap().len(), 1);

        let issued = orders.append_next(order).unwrap();
        assert_eq!(issued.order_number, u64::MAX - 1);
        assert!(matches!(
            orders.append_next(order),
            Err(LogStoreError::Exhausted { kind: "order" })
        ));
        assert_eq!(orders.counter().next(), u64::MAX);
    }

    #[test]
    fn missing_after_answers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut orders = open_orders(tmp.path());
        assert_eq!(orders.missing_after(None).unwrap(), CatchUp::UpToDate);
        assert_eq!(orders.missing_after(Some(0)).unwrap(), CatchUp::UpToDate);

        for _ in 0..4 {
            orders.append_next(order).unwrap();
        }
        assert_eq!(
            orders.missing_after(None).unwrap(),
            CatchUp::Behind((0..4).map(order).collect())
        );
        assert_eq!(
            orders.missing_after(Some(1)).unwrap(),
            CatchUp::Behind(vec![order(2), order(3)])
        );
        assert_eq!(orders.missing_after(Some(3)).unwrap(), CatchUp::UpToDate);
        assert_eq!(orders.missing_after(Some(8)).unwrap(), CatchUp::UpToDate);
    }

    #[test]
    fn merge_missing_sorts_and_reloads_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let mut orders = open_orders(tmp.path());
        orders.append_next(order).unwrap();
        orders
            .merge_missing(&[order(3), order(1), order(2)])
            .unwrap();
        let keys: Vec<u64> = orders
            .read_all()
            .unwrap()
            .iter()
            .map(|o| o.order_number)
            .collect();
        assert_eq!(keys, vec![0, 1, 2, 3]);
        assert_eq!(orders.counter().next(), 4);
    }

    #[test]
    fn invalidate_removes_tail_and_steps_counter_back() {
        let tmp = tempfile::tempdir().unwrap();
        let mut raft: LogDomain<RaftLogEntry> =
            LogDomain::open(LogFile::open(tmp.path().join("raft.jsonl")).unwrap()).unwrap();
        for _ in 0..2 {
            raft.append_next(|index| RaftLogEntry {
                index,
                term: 0,
                product_name: "Fox".to_string(),
                quantity: 1,
            })
            .unwrap();
        }
        assert_eq!(raft.counter().next(), 2);

        let removed = raft.invalidate(2).unwrap();
        assert_eq!(removed.map(|r| r.index), Some(1));
        assert_eq!(raft.counter().next(), 1);

        assert!(raft.invalidate(2).unwrap().is_none());
        assert_eq!(raft.counter().next(), 1);
        assert_eq!(raft.read_all().unwrap().len(), 1);
    }
}
