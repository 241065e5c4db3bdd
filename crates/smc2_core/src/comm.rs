//! Communicator context
//!
//! Rank, size and the blocking collectives the sampler needs, passed
//! explicitly into every operation that coordinates across nodes. Every
//! participant must issue the same collectives in the same order.
//!
//! - [`LocalComm`]: a single node; collectives are the identity.
//! - [`ThreadComm`]: an in-process group of participants (one per thread)
//!   synchronised with a barrier. Stands in for a multi-node transport.

use std::sync::{Arc, Barrier, Mutex, PoisonError};

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Whether this participant emits progress output.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise sum over all participants.
    fn all_reduce_sum_f64(&self, values: &[f64]) -> Vec<f64>;

    fn all_reduce_max_f64(&self, value: f64) -> f64;

    fn all_reduce_sum_u64(&self, value: u64) -> u64;

    fn barrier(&self);
}

/// Single-node context.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComm;

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum_f64(&self, values: &[f64]) -> Vec<f64> {
        values.to_vec()
    }

    fn all_reduce_max_f64(&self, value: f64) -> f64 {
        value
    }

    fn all_reduce_sum_u64(&self, value: u64) -> u64 {
        value
    }

    fn barrier(&self) {}
}

struct Shared {
    size: usize,
    barrier: Barrier,
    f64_slots: Mutex<Vec<Vec<f64>>>,
    u64_slots: Mutex<Vec<u64>>,
}

/// One participant of an in-process collective group.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl core::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl ThreadComm {
    /// Create a group of `size` participants; hand one to each thread.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "communicator group needs at least one participant");
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            f64_slots: Mutex::new(vec![Vec::new(); size]),
            u64_slots: Mutex::new(vec![0; size]),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Publish into this rank's slot, wait for everyone, combine, then wait
    /// again so no slot is overwritten before all ranks have read it.
    fn exchange_f64<F>(&self, values: &[f64], combine: F) -> Vec<f64>
    where
        F: Fn(&[Vec<f64>]) -> Vec<f64>,
    {
        {
            let mut slots = self
                .shared
                .f64_slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots[self.rank] = values.to_vec();
        }
        self.shared.barrier.wait();
        let result = {
            let slots = self
                .shared
                .f64_slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            combine(&slots)
        };
        self.shared.barrier.wait();
        result
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_reduce_sum_f64(&self, values: &[f64]) -> Vec<f64> {
        let n = values.len();
        self.exchange_f64(values, |slots| {
            let mut acc = vec![0.0; n];
            // rank order keeps the floating-point sum identical on every rank
            for slot in slots {
                for (a, v) in acc.iter_mut().zip(slot.iter()) {
                    *a += v;
                }
            }
            acc
        })
    }

    fn all_reduce_max_f64(&self, value: f64) -> f64 {
        let out = self.exchange_f64(&[value], |slots| {
            let mx = slots
                .iter()
                .filter_map(|s| s.first().copied())
                .fold(f64::NEG_INFINITY, f64::max);
            vec![mx]
        });
        out[0]
    }

    fn all_reduce_sum_u64(&self, value: u64) -> u64 {
        {
            let mut slots = self
                .shared
                .u64_slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots[self.rank] = value;
        }
        self.shared.barrier.wait();
        let total = {
            let slots = self
                .shared
                .u64_slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots.iter().sum()
        };
        self.shared.barrier.wait();
        total
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_local_is_identity() {
        let c = LocalComm;
        assert_eq!(c.rank(), 0);
        assert_eq!(c.size(), 1);
        assert!(c.is_root());
        assert_eq!(c.all_reduce_sum_f64(&[1.0, 2.0]), vec![1.0, 2.0]);
        assert_eq!(c.all_reduce_sum_u64(7), 7);
        assert_eq!(c.all_reduce_max_f64(-3.0), -3.0);
    }

    #[test]
    fn test_thread_group_reductions() {
        let group = ThreadComm::group(4);
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let r = comm.rank() as f64;
                    let sums = comm.all_reduce_sum_f64(&[r, 1.0]);
                    let mx = comm.all_reduce_max_f64(r * 10.0);
                    let count = comm.all_reduce_sum_u64(comm.rank() as u64 + 1);
                    // repeated collectives must not see stale slots
                    let again = comm.all_reduce_sum_f64(&[2.0]);
                    (sums, mx, count, again)
                })
            })
            .collect();

        for h in handles {
            let (sums, mx, count, again) = h.join().unwrap();
            assert_eq!(sums, vec![6.0, 4.0]);
            assert_eq!(mx, 30.0);
            assert_eq!(count, 10);
            assert_eq!(again, vec![8.0]);
        }
    }
}
