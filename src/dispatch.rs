//! Workgroup counts and partitioning of a convolution dispatch.
//!
//! The kernel maps output channels (N) to the x axis, output pixels (M) to
//! the y axis and batch to the z axis.  The binding scheme lets one
//! submission address a single batch index and a channel slice no wider
//! than the y group count, so the work is split into
//! `batch * partition_num` submissions.  When the pixel axis alone would
//! exceed the device ceiling, rows are split as well.

use std::ops::Range;

use crate::config::{DeviceLimits, TuningConfig};
use crate::error::{DispatchError, Result};
use crate::padding::ceil_div;
use crate::payload::PushPayload;

/// Round `value` up to a multiple of `alignment`.
pub fn align_size(value: u32, alignment: u32) -> u32 {
    ceil_div(value, alignment) * alignment
}

/// Groups needed to cover `extent` items, `block` items per invocation and
/// `local` invocations per group.
pub fn group_count(extent: u32, block: u32, local: u32) -> u32 {
    align_size(ceil_div(extent, block), local) / local
}

/// `ceil(total / span)`: number of slices of width `span` covering `total`.
pub fn partition_count(total: u32, span: u32) -> u32 {
    ceil_div(total, span)
}

/// One submission: a batch index, a channel slice and a row slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub batch_index: u32,
    pub channels: Range<u32>,
    pub rows: Range<u32>,
    pub groups: [u32; 3],
}

impl Partition {
    pub fn push_payload(&self, tuning: &TuningConfig) -> PushPayload {
        PushPayload {
            batch_index: self.batch_index,
            batch_end: self.batch_index + 1,
            channel_begin: self.channels.start,
            channel_end: self.channels.end,
            row_begin: self.rows.start,
            row_end: self.rows.end,
            block_width: tuning.block_width,
            block_height: tuning.block_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub n: u32,
    pub m: u32,
    pub batch: u32,
    pub local_size: [u32; 3],
    pub blocks: [u32; 3],
    /// Group counts of a single unpartitioned dispatch.
    pub natural_groups: [u32; 3],
    pub channel_span: u32,
    pub partition_num: u32,
    pub row_span: u32,
    pub row_partitions: u32,
}

impl DispatchPlan {
    pub fn new(
        n: u32,
        m: u32,
        batch: u32,
        local_size: [u32; 3],
        tuning: &TuningConfig,
        limits: &DeviceLimits,
    ) -> Result<Self> {
        tuning.validate()?;
        if n == 0 || m == 0 || batch == 0 {
            return Err(DispatchError::Configuration(format!(
                "empty dispatch: n={n} m={m} batch={batch}"
            )));
        }
        if local_size.contains(&0) {
            return Err(DispatchError::Configuration(format!(
                "local size {local_size:?} has a zero axis"
            )));
        }
        let [lx, ly, lz] = local_size;
        let [bw, bh, bd] = tuning.blocks();
        let max = limits.max_groups_per_dimension.max(1);

        let natural_groups = [
            group_count(n, bw, lx),
            group_count(m, bh, ly),
            group_count(batch, bd, lz),
        ];

        // A channel slice must still fit the x ceiling on its own.
        let max_channels = (max as u64 * lx as u64 * bw as u64).min(u32::MAX as u64) as u32;
        let channel_span = natural_groups[1].clamp(1, max_channels);
        let partition_num = partition_count(n, channel_span);

        let row_span = if natural_groups[1] <= max {
            m
        } else {
            (max as u64 * ly as u64 * bh as u64).min(m as u64) as u32
        };
        let row_partitions = partition_count(m, row_span);

        Ok(DispatchPlan {
            n,
            m,
            batch,
            local_size,
            blocks: tuning.blocks(),
            natural_groups,
            channel_span,
            partition_num,
            row_span,
            row_partitions,
        })
    }

    pub fn submission_count(&self) -> u64 {
        self.batch as u64 * self.partition_num as u64 * self.row_partitions as u64
    }

    /// Submissions in batch, channel, row order.
    pub fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        let [lx, ly, _] = self.local_size;
        let [bw, bh, _] = self.blocks;
        (0..self.batch).flat_map(move |batch_index| {
            (0..self.partition_num).flat_map(move |p| {
                let channels = slice(p, self.channel_span, self.n);
                (0..self.row_partitions).map(move |r| {
                    let rows = slice(r, self.row_span, self.m);
                    let groups = [
                        group_count(channels.len() as u32, bw, lx),
                        group_count(rows.len() as u32, bh, ly),
                        1,
                    ];
                    Partition {
                        batch_index,
                        channels: channels.clone(),
                        rows,
                        groups,
                    }
                })
            })
        })
    }
}

fn slice(index: u32, span: u32, total: u32) -> Range<u32> {
    let start = index * span;
    start..(start + span).min(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(n: u32, m: u32, batch: u32, local: [u32; 3], max: u32) -> DispatchPlan {
        let limits = DeviceLimits {
            max_groups_per_dimension: max,
            ..DeviceLimits::reference()
        };
        DispatchPlan::new(n, m, batch, local, &TuningConfig::conv_default(), &limits).unwrap()
    }

    #[test]
    fn group_count_rounds_up_twice() {
        assert_eq!(align_size(3, 16), 16);
        assert_eq!(align_size(32, 16), 32);
        assert_eq!(group_count(36, 16, 16), 1);
        assert_eq!(group_count(4097, 16, 16), 17);
        assert_eq!(group_count(5, 1, 1), 5);
        assert_eq!(group_count(3, 1, 4), 1);
    }

    #[test]
    fn partition_count_is_ceiling() {
        assert_eq!(partition_count(8, 1), 8);
        assert_eq!(partition_count(10, 3), 4);
        assert_eq!(partition_count(9, 3), 3);
    }

    #[test]
    fn end_to_end_geometry() {
        // 8x8 input, 3x3 valid filter: M = 36, N = 4.
        let p = plan(4, 36, 1, [1, 16, 1], 65_535);
        assert_eq!(p.natural_groups, [4, 1, 1]);
        assert_eq!(p.channel_span, 1);
        assert_eq!(p.partition_num, 4);
        assert_eq!(p.submission_count(), 4);
        let parts: Vec<_> = p.partitions().collect();
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|part| part.groups == [1, 1, 1] && part.rows == (0..36)));
    }

    #[test]
    fn partitions_cover_every_channel_once() {
        for n in 1..70 {
            for m in [1, 36, 300, 5000, 70_000] {
                let p = plan(n, m, 2, [1, 16, 4], 65_535);
                let mut hits = vec![0u32; n as usize];
                for part in p.partitions().filter(|part| part.batch_index == 0) {
                    for c in part.channels.clone() {
                        hits[c as usize] += 1;
                    }
                }
                assert!(hits.iter().all(|&h| h == 1), "n={n} m={m}");
                assert!(p.partition_num * p.channel_span >= n);
            }
        }
    }

    #[test]
    fn one_submission_per_batch_and_partition() {
        let p = plan(6, 600, 3, [1, 16, 4], 65_535);
        assert_eq!(p.natural_groups[1], 3);
        assert_eq!(p.partition_num, 2);
        let batches: Vec<u32> = p.partitions().map(|part| part.batch_index).collect();
        assert_eq!(batches, vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn groups_never_exceed_the_ceiling() {
        let max = 8;
        for (n, m) in [(1, 1), (100, 4096), (1000, 40_000), (17, 129 * 16 * 16)] {
            let p = plan(n, m, 1, [1, 16, 1], max);
            let mut rows = vec![0u32; m as usize];
            for part in p.partitions() {
                assert!(part.groups.iter().all(|&g| g >= 1 && g <= max), "{part:?}");
                if part.channels.start == 0 {
                    for r in part.rows.clone() {
                        rows[r as usize] += 1;
                    }
                }
            }
            assert!(rows.iter().all(|&r| r == 1), "n={n} m={m}");
        }
    }

    #[test]
    fn oversized_rows_are_split() {
        // natural y = ceil(ceil(40_000/16)/16) = 157 > 8
        let p = plan(1, 40_000, 1, [1, 16, 1], 8);
        assert_eq!(p.row_span, 8 * 16 * 16);
        assert_eq!(p.row_partitions, partition_count(40_000, 2048));
        // span is capped by the x ceiling, not the natural y count
        assert_eq!(p.channel_span, 8);
    }

    #[test]
    fn push_payload_selects_the_slice() {
        let p = plan(4, 36, 2, [1, 16, 1], 65_535);
        let last = p.partitions().last().unwrap();
        let push = last.push_payload(&TuningConfig::conv_default());
        assert_eq!(push.batch_index, 1);
        assert_eq!(push.batch_end, 2);
        assert_eq!((push.channel_begin, push.channel_end), (3, 4));
        assert_eq!((push.row_begin, push.row_end), (0, 36));
        assert_eq!((push.block_width, push.block_height), (1, 16));
    }

    #[test]
    fn empty_dispatches_are_rejected() {
        let limits = DeviceLimits::reference();
        let tuning = TuningConfig::conv_default();
        assert!(DispatchPlan::new(0, 4, 1, [1, 16, 1], &tuning, &limits).is_err());
        assert!(DispatchPlan::new(4, 4, 1, [1, 0, 1], &tuning, &limits).is_err());
    }
}
