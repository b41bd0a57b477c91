#![cfg_attr(not(test), no_std)]

use heapless::Vec;
use ldma_core::{ChannelId, CounterValue, TraceSample};

pub mod report;

pub const MAX_LANES: usize = 8;

/// Elements per printed row; the per-grant block size of the reference setup.
pub const DEFAULT_ROW_LEN: usize = 32;

/// The samples one channel recorded, in the order it recorded them.
#[derive(Debug, Clone, Copy)]
pub struct Lane<'a> {
    pub channel: ChannelId,
    pub samples: &'a [u32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedSample {
    /// Position of the lane in the observer.
    pub lane: usize,
    pub sample: TraceSample,
}

/// `row_len` consecutive elements serviced for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub lane: usize,
    pub channel: ChannelId,
    pub first: CounterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneStats {
    pub channel: ChannelId,
    pub elements: usize,
    /// Uninterrupted stretches of this channel in the merged trace.
    pub runs: usize,
    pub longest_run: usize,
}

impl LaneStats {
    /// Blocks the arbiter handed out per turn, judging by the longest run.
    pub fn blocks_per_grant(&self, block_len: usize) -> usize {
        self.longest_run / block_len
    }
}

/// Rebuilds the global service order of several channels from their
/// separately captured counter snapshots.
pub struct TraceObserver<'a> {
    lanes: Vec<Lane<'a>, MAX_LANES>,
}

impl<'a> TraceObserver<'a> {
    /// # Panics
    ///
    /// If more than [`MAX_LANES`] lanes are given.
    pub fn new(lanes: impl IntoIterator<Item = Lane<'a>>) -> Self {
        let mut this = Self { lanes: Vec::new() };
        for lane in lanes {
            this.lanes
                .push(lane)
                .ok()
                .expect("too many lanes for the trace observer");
        }
        this
    }

    pub fn lanes(&self) -> &[Lane<'a>] {
        &self.lanes
    }

    pub fn total_samples(&self) -> usize {
        self.lanes.iter().map(|lane| lane.samples.len()).sum()
    }

    /// All samples in ascending counter order.
    ///
    /// Each step takes the lane whose next unconsumed value is smallest. On
    /// equal values the lane listed first wins, so the order is fully
    /// determined by the input.
    pub fn merged(&self) -> Merged<'_, 'a> {
        Merged {
            lanes: &self.lanes,
            cursors: [0; MAX_LANES],
        }
    }

    /// Walks the merged trace and calls `f` for every `row_len` consecutive
    /// elements of one channel. The run counter restarts whenever service
    /// switches to another channel, so partial runs are never printed.
    pub fn feed(&self, row_len: usize, mut f: impl FnMut(Row)) {
        assert!(row_len > 0);

        let mut current = None;
        let mut run = 0;
        let mut first = CounterValue(0);

        for MergedSample { lane, sample } in self.merged() {
            if current != Some(lane) {
                current = Some(lane);
                run = 0;
            }
            if run == 0 {
                first = sample.value;
            }

            run += 1;
            if run == row_len {
                f(Row {
                    lane,
                    channel: sample.channel,
                    first,
                });
                run = 0;
            }
        }
    }

    pub fn stats(&self) -> Vec<LaneStats, MAX_LANES> {
        let mut stats: Vec<LaneStats, MAX_LANES> = self
            .lanes
            .iter()
            .map(|lane| LaneStats {
                channel: lane.channel,
                elements: lane.samples.len(),
                runs: 0,
                longest_run: 0,
            })
            .collect();

        let mut current = None;
        let mut run = 0;

        for MergedSample { lane, .. } in self.merged() {
            if current != Some(lane) {
                current = Some(lane);
                run = 0;
                stats[lane].runs += 1;
            }
            run += 1;
            stats[lane].longest_run = stats[lane].longest_run.max(run);
        }

        stats
    }
}

pub struct Merged<'o, 'a> {
    lanes: &'o [Lane<'a>],
    cursors: [usize; MAX_LANES],
}

impl Iterator for Merged<'_, '_> {
    type Item = MergedSample;

    fn next(&mut self) -> Option<Self::Item> {
        let mut min: Option<(usize, u32)> = None;

        for (i, lane) in self.lanes.iter().enumerate() {
            let Some(&value) = lane.samples.get(self.cursors[i]) else {
                continue;
            };
            match min {
                Some((_, min_value)) if min_value <= value => {}
                _ => min = Some((i, value)),
            }
        }

        let (lane, value) = min?;
        let seq = self.cursors[lane];
        self.cursors[lane] += 1;

        Some(MergedSample {
            lane,
            sample: TraceSample {
                channel: self.lanes[lane].channel,
                seq,
                value: CounterValue(value),
            },
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .lanes
            .iter()
            .zip(&self.cursors)
            .map(|(lane, &cursor)| lane.samples.len() - cursor)
            .sum();
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn ch(i: u8) -> ChannelId {
        ChannelId::new(i).unwrap()
    }

    #[test]
    fn merges_in_counter_order() {
        let a = [1, 2, 3, 10, 11];
        let b = [4, 5, 12];
        let c = [6, 7, 8, 9];
        let observer = TraceObserver::new([
            Lane { channel: ch(2), samples: &a },
            Lane { channel: ch(3), samples: &b },
            Lane { channel: ch(4), samples: &c },
        ]);

        let merged: std::vec::Vec<_> = observer.merged().collect();
        assert_eq!(merged.len(), 12);
        assert_eq!(observer.merged().size_hint(), (12, Some(12)));
        assert!(merged
            .windows(2)
            .all(|w| w[0].sample.value <= w[1].sample.value));

        let lanes: std::vec::Vec<_> = merged.iter().map(|m| m.lane).collect();
        assert_eq!(lanes, [0, 0, 0, 1, 1, 2, 2, 2, 2, 0, 0, 1]);
        assert_eq!(merged[9].sample.seq, 3);
        assert_eq!(merged[11].sample.channel, ch(3));
    }

    #[test]
    fn ties_go_to_the_first_lane() {
        let a = [5, 9];
        let b = [5, 9];
        let observer = TraceObserver::new([
            Lane { channel: ch(7), samples: &a },
            Lane { channel: ch(1), samples: &b },
        ]);

        let order: std::vec::Vec<_> = observer.merged().map(|m| m.lane).collect();
        assert_eq!(order, [0, 1, 0, 1]);
    }

    #[test]
    fn empty_and_uneven_lanes() {
        let a: [u32; 0] = [];
        let b = [3, 4];
        let observer = TraceObserver::new([
            Lane { channel: ch(0), samples: &a },
            Lane { channel: ch(1), samples: &b },
        ]);
        assert_eq!(observer.total_samples(), 2);
        assert_eq!(observer.merged().count(), 2);

        let observer = TraceObserver::new([]);
        assert_eq!(observer.merged().next(), None);
    }

    #[test]
    fn rows_need_uninterrupted_runs() {
        // 5 from lane 0, 2 from lane 1, 3 from lane 0
        let a = [0, 1, 2, 3, 4, 7, 8, 9];
        let b = [5, 6];
        let observer = TraceObserver::new([
            Lane { channel: ch(2), samples: &a },
            Lane { channel: ch(3), samples: &b },
        ]);

        let mut rows = std::vec::Vec::new();
        observer.feed(2, |row| rows.push(row));

        assert_eq!(
            rows,
            [
                Row { lane: 0, channel: ch(2), first: CounterValue(0) },
                Row { lane: 0, channel: ch(2), first: CounterValue(2) },
                Row { lane: 1, channel: ch(3), first: CounterValue(5) },
                Row { lane: 0, channel: ch(2), first: CounterValue(7) },
            ]
        );
    }

    #[test]
    fn run_statistics() {
        let a: std::vec::Vec<u32> = (0..32).chain(96..128).collect();
        let b: std::vec::Vec<u32> = (32..96).collect();
        let observer = TraceObserver::new([
            Lane { channel: ch(2), samples: &a },
            Lane { channel: ch(3), samples: &b },
        ]);

        let stats = observer.stats();
        assert_eq!(stats[0].runs, 2);
        assert_eq!(stats[0].longest_run, 32);
        assert_eq!(stats[0].blocks_per_grant(32), 1);
        assert_eq!(stats[1].runs, 1);
        assert_eq!(stats[1].elements, 64);
        assert_eq!(stats[1].blocks_per_grant(32), 2);
    }

    #[test]
    #[should_panic(expected = "too many lanes")]
    fn lane_limit() {
        let samples = [0u32];
        TraceObserver::new((0..=MAX_LANES as u8).map(|i| Lane {
            channel: ch(i),
            samples: &samples,
        }));
    }

    #[test]
    fn recovers_random_interleavings() {
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let lanes = rng.gen_range(1..=MAX_LANES);
            let mut captured = vec![std::vec::Vec::new(); lanes];
            let mut truth = std::vec::Vec::new();
            let mut counter = rng.gen_range(0..1000u32);

            for _ in 0..rng.gen_range(0..64) {
                let lane = rng.gen_range(0..lanes);
                for _ in 0..rng.gen_range(1..40) {
                    counter += rng.gen_range(1..5);
                    captured[lane].push(counter);
                    truth.push((lane, counter));
                }
            }

            let observer = TraceObserver::new(
                captured
                    .iter()
                    .enumerate()
                    .map(|(i, samples)| Lane { channel: ch(i as u8), samples }),
            );
            let merged: std::vec::Vec<_> = observer
                .merged()
                .map(|m| (m.lane, m.sample.value.0))
                .collect();
            assert_eq!(merged, truth);
        }
    }
}
