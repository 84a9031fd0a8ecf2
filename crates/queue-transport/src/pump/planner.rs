//! Split a concurrency budget into parallel receive loops.

use crate::config::MAX_RECEIVE_BATCH_SIZE;

/// Batch size of every receive loop a pump runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfiguration {
    batch_sizes: Vec<u32>,
}

impl ReceiverConfiguration {
    /// Plan receive loops for `max_concurrency` in-flight messages.
    ///
    /// - Neither setting fixed: as few loops as possible, each filled to the
    ///   receive cap, the remainder in the last loop.
    /// - Batch size fixed: enough loops of that size to cover the budget.
    /// - Parallelism fixed: that many loops, each asking for 20% more than
    ///   its share to amortize the cost of a fetch, capped at 32.
    /// - Both fixed: used as given.
    pub fn plan(max_concurrency: u32, batch_size: Option<u32>, parallelism: Option<u32>) -> Self {
        let concurrency = max_concurrency.max(1);
        let batch_size = batch_size.map(|b| b.clamp(1, MAX_RECEIVE_BATCH_SIZE));
        let parallelism = parallelism.map(|p| p.max(1));

        let batch_sizes = match (batch_size, parallelism) {
            (None, None) => {
                let cap = concurrency.min(MAX_RECEIVE_BATCH_SIZE);
                let loops = concurrency.div_ceil(cap);
                (0..loops)
                    .map(|i| {
                        if i + 1 == loops {
                            concurrency - cap * (loops - 1)
                        } else {
                            cap
                        }
                    })
                    .collect()
            }
            (Some(batch), None) => vec![batch; concurrency.div_ceil(batch) as usize],
            (None, Some(loops)) => {
                // ceil(1.2 * L / P) in integers
                let inflated = (6 * concurrency).div_ceil(5 * loops);
                let batch = inflated.clamp(1, MAX_RECEIVE_BATCH_SIZE);
                vec![batch; loops as usize]
            }
            (Some(batch), Some(loops)) => vec![batch; loops as usize],
        };

        Self { batch_sizes }
    }

    pub fn batch_sizes(&self) -> &[u32] {
        &self.batch_sizes
    }

    pub fn loop_count(&self) -> usize {
        self.batch_sizes.len()
    }
}

#[cfg(test)]
#[path = "planner_tests.rs"]
mod tests;
