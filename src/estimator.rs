//! Delay estimation: clock-skew correction, per-peer sample windows and the
//! shared table of published per-peer delays.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crate::time::Timestamp;

/// Number of forward samples collected before an estimate is published.
pub const WINDOW_CAPACITY: usize = 10;

/// The three timestamps of one completed probe exchange.
///
/// `sent_at` and `client_arrival_at` are on the Prober's clock,
/// `server_arrival_at` is on the Responder's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub sent_at: Timestamp,
    pub server_arrival_at: Timestamp,
    pub client_arrival_at: Timestamp,
}

/// Delays derived from a [`ProbeSample`], in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedSample {
    pub round_trip_ms: f64,
    pub forward_ms: f64,
    pub reverse_ms: f64,
}

impl DerivedSample {
    pub fn from_probe(sample: &ProbeSample) -> Self {
        let forward_raw = sample.server_arrival_at.abs_diff_ms(&sample.sent_at);
        let round_trip = sample.client_arrival_at.abs_diff_ms(&sample.sent_at);
        let reverse_raw = sample.client_arrival_at.abs_diff_ms(&sample.server_arrival_at);
        Self::from_legs(forward_raw, reverse_raw, round_trip)
    }

    /// Scales the one-way legs down when their sum exceeds the round trip.
    ///
    /// The round trip is measured on a single clock, the legs are not, so any
    /// inflation of `forward + reverse` over `round_trip` is attributed to clock
    /// offset and removed proportionally from both legs.
    pub fn from_legs(forward_raw: f64, reverse_raw: f64, round_trip: f64) -> Self {
        let drift = if round_trip > 0.0 {
            (forward_raw + reverse_raw) / round_trip
        } else {
            // Nothing to reconcile against.
            0.0
        };

        let (forward_ms, reverse_ms) = if drift >= 1.0 {
            (forward_raw / drift, reverse_raw / drift)
        } else {
            (forward_raw, reverse_raw)
        };

        DerivedSample {
            round_trip_ms: round_trip,
            forward_ms,
            reverse_ms,
        }
    }
}

/// Returns the lower median of `values`, reordering the slice in place.
///
/// Quickselect with a median-of-three pivot: only the partition holding the
/// median rank is refined further, so a single order statistic is found
/// without sorting. For even lengths the element at rank `(n - 1) / 2` of the
/// sorted order is returned. Returns `None` for an empty slice.
pub fn select_median<T: PartialOrd + Copy>(values: &mut [T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }

    let mut low = 0;
    let mut high = values.len() - 1;
    let median = high / 2;

    loop {
        if high <= low {
            return Some(values[median]);
        }

        if high == low + 1 {
            if values[low] > values[high] {
                values.swap(low, high);
            }
            return Some(values[median]);
        }

        // Order low/middle/high so the pivot (median of the three) sits at low
        // and the smallest of the three sits at low + 1 as a sentinel.
        let middle = (low + high) / 2;
        if values[middle] > values[high] {
            values.swap(middle, high);
        }
        if values[low] > values[high] {
            values.swap(low, high);
        }
        if values[middle] > values[low] {
            values.swap(middle, low);
        }
        values.swap(middle, low + 1);

        let mut ll = low + 1;
        let mut hh = high;
        loop {
            ll += 1;
            while values[low] > values[ll] {
                ll += 1;
            }
            hh -= 1;
            while values[hh] > values[low] {
                hh -= 1;
            }
            if hh < ll {
                break;
            }
            values.swap(ll, hh);
        }

        values.swap(low, hh);

        if hh <= median {
            low = ll;
        }
        if hh >= median {
            high = hh - 1;
        }
    }
}

/// Fixed-capacity buffer of forward samples for one peer.
///
/// Filled once per measurement cycle, then cleared and refilled; there is no
/// continuous eviction.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: [f64; WINDOW_CAPACITY],
    len: usize,
}

impl SampleWindow {
    pub fn new() -> Self {
        SampleWindow {
            samples: [0.0; WINDOW_CAPACITY],
            len: 0,
        }
    }

    /// Records a forward sample and returns `true` once the window is full.
    ///
    /// Pushing into a full window is ignored.
    pub fn push(&mut self, forward_ms: f64) -> bool {
        if self.len < WINDOW_CAPACITY {
            self.samples[self.len] = forward_ms;
            self.len += 1;
        }
        self.is_full()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == WINDOW_CAPACITY
    }

    /// Median of the samples collected so far.
    ///
    /// Selection reorders the stored samples, which is harmless since the
    /// window is reset after each estimate.
    pub fn estimate(&mut self) -> Option<f64> {
        select_median(&mut self.samples[..self.len])
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Published per-peer delay estimates, indexed by peer index.
///
/// Each slot is a single atomic cell holding the bit pattern of an `f64`, so
/// readers never observe a torn value and never take a lock. Every slot has
/// exactly one writer, obtained through [`DelayTable::claim`].
pub struct DelayTable {
    slots: Box<[AtomicU64]>,
    claimed: Box<[AtomicBool]>,
}

impl DelayTable {
    /// Creates a table with `peers` slots, all reading 0.0.
    pub fn new(peers: usize) -> Self {
        DelayTable {
            slots: (0..peers).map(|_| AtomicU64::new(0f64.to_bits())).collect(),
            claimed: (0..peers).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current estimate for `index` in milliseconds, or `None` if out of range.
    pub fn get(&self, index: usize) -> Option<f64> {
        self.slots
            .get(index)
            .map(|slot| f64::from_bits(slot.load(Ordering::Acquire)))
    }

    /// Snapshot of every slot in index order.
    pub fn snapshot(&self) -> Vec<f64> {
        self.slots
            .iter()
            .map(|slot| f64::from_bits(slot.load(Ordering::Acquire)))
            .collect()
    }

    /// Hands out the single write handle for `index`.
    ///
    /// Returns `None` if the index is out of range or already claimed.
    pub fn claim(self: &Arc<Self>, index: usize) -> Option<SlotWriter> {
        let flag = self.claimed.get(index)?;
        if flag.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(SlotWriter {
            table: Arc::clone(self),
            index,
        })
    }
}

/// Exclusive write access to one slot of a [`DelayTable`].
pub struct SlotWriter {
    table: Arc<DelayTable>,
    index: usize,
}

impl SlotWriter {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Publishes a new estimate with a single atomic store.
    pub fn publish(&self, delay_ms: f64) {
        self.table.slots[self.index].store(delay_ms.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sorted_lower_median(values: &[f64]) -> f64 {
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        sorted[(sorted.len() - 1) / 2]
    }

    #[test]
    fn test_drift_correction_applied() {
        let sample = DerivedSample::from_legs(30.0, 10.0, 20.0);
        assert_eq!(sample.forward_ms, 15.0);
        assert_eq!(sample.reverse_ms, 5.0);
        assert_eq!(sample.round_trip_ms, 20.0);
    }

    #[test]
    fn test_drift_below_one_leaves_legs() {
        let sample = DerivedSample::from_legs(5.0, 5.0, 20.0);
        assert_eq!(sample.forward_ms, 5.0);
        assert_eq!(sample.reverse_ms, 5.0);
    }

    #[test]
    fn test_drift_exactly_one() {
        let sample = DerivedSample::from_legs(8.0, 12.0, 20.0);
        assert_eq!(sample.forward_ms, 8.0);
        assert_eq!(sample.reverse_ms, 12.0);
    }

    #[test]
    fn test_zero_round_trip_skips_correction() {
        let sample = DerivedSample::from_legs(4.0, 4.0, 0.0);
        assert_eq!(sample.forward_ms, 4.0);
        assert_eq!(sample.reverse_ms, 4.0);
        assert!(sample.forward_ms.is_finite());
    }

    #[test]
    fn test_from_probe_with_skewed_responder_clock() {
        // Responder clock runs 100 ms ahead; true one-way delay is 5 ms each way.
        let sample = ProbeSample {
            sent_at: Timestamp::new(1000, 0),
            server_arrival_at: Timestamp::new(1000, 105_000),
            client_arrival_at: Timestamp::new(1000, 10_000),
        };
        let derived = DerivedSample::from_probe(&sample);
        assert_eq!(derived.round_trip_ms, 10.0);
        // forward_raw = 105, reverse_raw = 95, drift = 20
        assert!((derived.forward_ms - 5.25).abs() < 1e-9);
        assert!((derived.reverse_ms - 4.75).abs() < 1e-9);
        assert!((derived.forward_ms + derived.reverse_ms - derived.round_trip_ms).abs() < 1e-9);
    }

    #[test]
    fn test_select_median_outlier_suppressed() {
        let mut window = [12.0, 11.0, 13.0, 12.0, 50.0, 12.0, 11.0, 13.0, 12.0, 11.0];
        let reference = sorted_lower_median(&window);
        assert_eq!(select_median(&mut window), Some(12.0));
        assert_eq!(reference, 12.0);
    }

    #[test]
    fn test_select_median_small_windows() {
        assert_eq!(select_median::<f64>(&mut []), None);
        assert_eq!(select_median(&mut [7.0]), Some(7.0));

        let mut pair = [9.0, 3.0];
        assert_eq!(select_median(&mut pair), Some(3.0));
        assert_eq!(pair, [3.0, 9.0]);

        assert_eq!(select_median(&mut [3.0, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn test_select_median_ties() {
        assert_eq!(select_median(&mut [5.0; 10]), Some(5.0));
        assert_eq!(select_median(&mut [1, 2, 2, 2, 3]), Some(2));
    }

    #[test]
    fn test_window_fill_and_reset() {
        let mut window = SampleWindow::new();
        assert!(window.is_empty());
        assert_eq!(window.estimate(), None);

        for i in 0..WINDOW_CAPACITY - 1 {
            assert!(!window.push(i as f64));
        }
        assert!(window.push(100.0));
        assert!(window.is_full());
        // Ignored once full.
        assert!(window.push(1000.0));
        assert_eq!(window.len(), WINDOW_CAPACITY);

        assert_eq!(window.estimate(), Some(4.0));

        window.reset();
        assert!(window.is_empty());
        window.push(42.0);
        assert_eq!(window.estimate(), Some(42.0));
    }

    #[test]
    fn test_delay_table_single_writer() {
        let table = Arc::new(DelayTable::new(2));
        assert_eq!(table.get(0), Some(0.0));
        assert_eq!(table.get(2), None);

        let writer = table.claim(1).expect("slot 1 is free");
        assert!(table.claim(1).is_none());
        assert!(table.claim(5).is_none());

        writer.publish(12.5);
        assert_eq!(writer.index(), 1);
        assert_eq!(table.get(1), Some(12.5));
        assert_eq!(table.snapshot(), vec![0.0, 12.5]);
    }

    #[test]
    fn test_delay_table_concurrent_readers_see_whole_values() {
        let table = Arc::new(DelayTable::new(1));
        let writer = table.claim(0).unwrap();
        let reader_table = Arc::clone(&table);

        let reader = std::thread::spawn(move || {
            for _ in 0..10_000 {
                let v = reader_table.get(0).unwrap();
                assert!(v == 0.0 || v == 1.25 || v == 987.5);
            }
        });
        for i in 0..10_000 {
            writer.publish(if i % 2 == 0 { 1.25 } else { 987.5 });
        }
        reader.join().unwrap();
    }

    proptest! {
        #[test]
        fn select_matches_full_sort(values in prop::collection::vec(-1.0e6f64..1.0e6, 1..64)) {
            let expected = sorted_lower_median(&values);
            let mut work = values.clone();
            prop_assert_eq!(select_median(&mut work), Some(expected));
        }

        #[test]
        fn select_matches_full_sort_with_duplicates(values in prop::collection::vec(0u8..5, 1..32)) {
            let mut sorted = values.clone();
            sorted.sort_unstable();
            let mut work = values.clone();
            prop_assert_eq!(select_median(&mut work), Some(sorted[(sorted.len() - 1) / 2]));
        }
    }
}
