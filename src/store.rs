//! Thread-indexed storage of accumulated region values.
//!
//! Every region keeps one [`RegionValue`] per slot. The first [`FIXED_SLOTS`] slots are
//! synthetic: slot 0 counts region entries and slot 1 measures elapsed cycles. The remaining slots
//! follow the flattened event order of the [`crate::Registry`].

use crate::{EventKind, Result, ThreadId};
use std::collections::BTreeMap;

/// Number of synthetic slots ahead of the user events.
pub const FIXED_SLOTS: usize = 2;

/// Slot counting region entries.
pub const REGION_COUNT_SLOT: usize = 0;

/// Slot measuring elapsed cycles.
pub const CYCLES_SLOT: usize = 1;

/// The kind of region call being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOp {
    /// Region entry.
    Begin,
    /// Intermediate sample.
    Read,
    /// Region exit.
    End,
}

impl RegionOp {
    /// Name of the public operation, as used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            RegionOp::Begin => "region_begin",
            RegionOp::Read => "region_read",
            RegionOp::End => "region_end",
        }
    }
}

/// Accumulated state of one slot of one region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionValue {
    /// Value captured at the latest begin.
    pub offset: i64,
    /// Accumulated value.
    pub total: i64,
    /// Intermediate samples, oldest first.
    pub reads: Vec<i64>,
}

/// A named region of one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionNode {
    /// Region name.
    pub name: String,
    /// One value per slot.
    pub values: Vec<RegionValue>,
}

impl RegionNode {
    fn new(name: &str, slots: usize) -> Self {
        RegionNode {
            name: String::from(name),
            values: vec![RegionValue::default(); slots],
        }
    }

    /// Number of completed begin/end pairs.
    #[inline]
    pub fn region_count(&self) -> i64 {
        self.values[REGION_COUNT_SLOT].total
    }

    /// Accumulated elapsed cycles.
    #[inline]
    pub fn cycles(&self) -> i64 {
        self.values[CYCLES_SLOT].total
    }

    /// Value of the `idx`-th user event.
    #[inline]
    pub fn event(&self, idx: usize) -> Option<&RegionValue> {
        self.values.get(FIXED_SLOTS + idx)
    }
}

/// Snapshot of a thread's counters.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    /// Elapsed cycles since the thread's sessions were started.
    pub cycles: i64,
    /// Raw values of every user event, flattened in registry order.
    pub values: &'a [i64],
}

/// Regions of every thread that ever began one.
#[derive(Debug, Clone, Default)]
pub struct RegionStore {
    kinds: Vec<EventKind>,
    /// Regions of each thread, in insertion order.
    threads: BTreeMap<ThreadId, Vec<RegionNode>>,
    begin_count: u64,
    end_count: u64,
}

impl RegionStore {
    /// Create an empty store for events of the given kinds.
    pub fn new(kinds: Vec<EventKind>) -> Self {
        RegionStore {
            kinds,
            ..Default::default()
        }
    }

    /// Number of slots of every region.
    #[inline]
    pub fn slots(&self) -> usize {
        FIXED_SLOTS + self.kinds.len()
    }

    /// Fold `sample` into `region` of `thread`.
    ///
    /// `Begin` creates the thread and region entries on demand. `Read` and `End` fail with
    /// [`crate::Error::NoMatchingRegion`] if the region was never begun on `thread`, without
    /// creating anything.
    pub fn record(
        &mut self,
        thread: ThreadId,
        region: &str,
        op: RegionOp,
        sample: Sample<'_>,
    ) -> Result<()> {
        let slots = self.slots();
        let kinds = &self.kinds;
        let unmatched = || crate::Error::NoMatchingRegion {
            region: String::from(region),
            op: op.name(),
        };

        let node = match op {
            RegionOp::Begin => {
                let regions = self.threads.entry(thread).or_insert_with(Vec::new);
                let idx = match regions.iter().position(|r| r.name == region) {
                    Some(idx) => idx,
                    None => {
                        regions.push(RegionNode::new(region, slots));
                        regions.len() - 1
                    }
                };
                &mut regions[idx]
            }
            RegionOp::Read | RegionOp::End => self
                .threads
                .get_mut(&thread)
                .and_then(|regions| regions.iter_mut().find(|r| r.name == region))
                .ok_or_else(unmatched)?,
        };

        let (fixed, events) = node.values.split_at_mut(FIXED_SLOTS);
        let user = events.iter_mut().zip(kinds.iter()).zip(sample.values.iter());
        match op {
            RegionOp::Begin => {
                fixed[REGION_COUNT_SLOT].offset = 1;
                fixed[CYCLES_SLOT].offset = sample.cycles;
                for ((value, _), raw) in user {
                    value.offset = *raw;
                }
                self.begin_count += 1;
            }
            RegionOp::Read => {
                let cycles = &mut fixed[CYCLES_SLOT];
                cycles.reads.push(sample.cycles - cycles.offset);
                for ((value, kind), raw) in user {
                    let read = match kind {
                        EventKind::Delta => *raw - value.offset,
                        EventKind::Instant => *raw,
                    };
                    value.reads.push(read);
                }
            }
            RegionOp::End => {
                let count = &mut fixed[REGION_COUNT_SLOT];
                count.total += count.offset;
                let cycles = &mut fixed[CYCLES_SLOT];
                cycles.total += sample.cycles - cycles.offset;
                // Instant values are summed over all completed invocations.
                for ((value, kind), raw) in user {
                    value.total += match kind {
                        EventKind::Delta => *raw - value.offset,
                        EventKind::Instant => *raw,
                    };
                }
                self.end_count += 1;
            }
        }
        Ok(())
    }

    /// Regions of `thread`, newest first.
    pub fn regions(&self, thread: ThreadId) -> impl Iterator<Item = &RegionNode> {
        self.threads
            .get(&thread)
            .into_iter()
            .flat_map(|regions| regions.iter().rev())
    }

    /// Look up a single region.
    pub fn region(&self, thread: ThreadId, name: &str) -> Option<&RegionNode> {
        self.threads
            .get(&thread)
            .and_then(|regions| regions.iter().find(|r| r.name == name))
    }

    /// Threads with at least one region, in ascending order.
    pub fn threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.keys().copied()
    }

    /// Number of threads with at least one region.
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Number of recorded region entries over all threads.
    #[inline]
    pub fn begin_count(&self) -> u64 {
        self.begin_count
    }

    /// Number of recorded region exits over all threads.
    #[inline]
    pub fn end_count(&self) -> u64 {
        self.end_count
    }

    /// Check if every recorded entry was matched by an exit.
    #[inline]
    pub fn is_balanced(&self) -> bool {
        self.begin_count == self.end_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const T1: ThreadId = ThreadId(1);
    const T2: ThreadId = ThreadId(2);

    fn sample(cycles: i64, values: &[i64]) -> Sample<'_> {
        Sample { cycles, values }
    }

    fn store() -> RegionStore {
        RegionStore::new(vec![EventKind::Delta, EventKind::Instant])
    }

    #[test]
    fn test_begin_end_pairs() {
        let mut s = store();
        s.record(T1, "A", RegionOp::Begin, sample(100, &[10, 7])).unwrap();
        s.record(T1, "A", RegionOp::End, sample(150, &[25, 9])).unwrap();
        s.record(T1, "A", RegionOp::Begin, sample(200, &[40, 3])).unwrap();
        s.record(T1, "A", RegionOp::End, sample(230, &[45, 4])).unwrap();

        let node = s.region(T1, "A").unwrap();
        assert_eq!(node.region_count(), 2);
        assert_eq!(node.cycles(), 50 + 30);
        assert_eq!(node.event(0).unwrap().total, 15 + 5);
        assert!(s.is_balanced());
        assert_eq!(s.begin_count(), 2);
    }

    #[test]
    fn test_instant_values_are_summed() {
        // Instant readings taken at each end are added up, not replaced.
        let mut s = store();
        for reading in &[9, 4, 6] {
            s.record(T1, "A", RegionOp::Begin, sample(0, &[0, 1])).unwrap();
            s.record(T1, "A", RegionOp::End, sample(0, &[0, *reading])).unwrap();
        }
        assert_eq!(s.region(T1, "A").unwrap().event(1).unwrap().total, 19);
    }

    #[test]
    fn test_reads_chronological() {
        let mut s = store();
        s.record(T1, "A", RegionOp::Begin, sample(100, &[10, 7])).unwrap();
        s.record(T1, "A", RegionOp::Read, sample(110, &[12, 8])).unwrap();
        s.record(T1, "A", RegionOp::Read, sample(130, &[20, 5])).unwrap();
        s.record(T1, "A", RegionOp::End, sample(140, &[21, 5])).unwrap();

        let node = s.region(T1, "A").unwrap();
        assert!(node.values[REGION_COUNT_SLOT].reads.is_empty());
        assert_eq!(node.values[CYCLES_SLOT].reads, vec![10, 30]);
        assert_eq!(node.event(0).unwrap().reads, vec![2, 10]);
        assert_eq!(node.event(1).unwrap().reads, vec![8, 5]);
        assert_eq!(node.event(0).unwrap().total, 11);
        // Reads neither count as entries nor exits.
        assert_eq!(s.begin_count(), 1);
        assert_eq!(s.end_count(), 1);
    }

    #[test]
    fn test_unmatched_read_and_end() {
        let mut s = store();
        let err = s.record(T1, "A", RegionOp::End, sample(0, &[0, 0])).unwrap_err();
        match err {
            Error::NoMatchingRegion { region, op } => {
                assert_eq!(region, "A");
                assert_eq!(op, "region_end");
            }
            e => panic!("unexpected error {}", e),
        }
        assert_eq!(s.thread_count(), 0);

        s.record(T1, "A", RegionOp::Begin, sample(0, &[0, 0])).unwrap();
        let err = s.record(T1, "B", RegionOp::Read, sample(0, &[0, 0])).unwrap_err();
        assert_eq!(err.to_string(), "Cannot find matching region for region_read(\"B\")");
        assert!(s.region(T1, "B").is_none());
        assert_eq!(s.regions(T1).count(), 1);
        assert_eq!(s.end_count(), 0);
    }

    #[test]
    fn test_threads_are_disjoint() {
        let mut s = store();
        s.record(T2, "B", RegionOp::Begin, sample(0, &[0, 0])).unwrap();
        s.record(T1, "A", RegionOp::Begin, sample(0, &[0, 0])).unwrap();
        assert!(s.region(T1, "B").is_none());
        assert!(s.region(T2, "A").is_none());
        assert_eq!(s.threads().collect::<Vec<_>>(), vec![T1, T2]);
        assert!(!s.is_balanced());
    }

    #[test]
    fn test_regions_newest_first() {
        let mut s = store();
        for name in &["first", "second", "third"] {
            s.record(T1, name, RegionOp::Begin, sample(0, &[0, 0])).unwrap();
            s.record(T1, name, RegionOp::End, sample(0, &[0, 0])).unwrap();
        }
        // Re-entering a region does not move it.
        s.record(T1, "first", RegionOp::Begin, sample(0, &[0, 0])).unwrap();
        let names: Vec<&str> = s.regions(T1).map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["third", "second", "first"]);
        assert_eq!(s.regions(T2).count(), 0);
    }
}
