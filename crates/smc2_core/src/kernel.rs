//! Max log-density reduction kernel
//!
//! One lane per (particle, sub-state-element) pair. Each lane evaluates its
//! log-density contribution; lanes sharing a particle then accumulate into a
//! single per-particle total over `n_elements` synchronised rounds. In round
//! `r` only lane `r` adds into the accumulator, and a barrier closes every
//! round, so no lane ever reads a total that another lane is updating. Lane 0
//! writes the totals out.
//!
//! The summation order is element 0, 1, …, `n_elements - 1` in every mode, so
//! [`ReductionMode::Serial`] and [`ReductionMode::Barrier`] agree bit for bit.
//! [`ReductionMode::Gpu`] runs the same rounds in a compute shader (see
//! `crate::gpu`, behind the `gpu` feature) and accumulates in `f32`.
//!
//! Barrier lanes are dedicated OS threads, not rayon tasks: every lane blocks
//! on the round barrier until all `n_elements` lanes arrive. A panicking
//! density still passes through every round and the panic is re-raised on
//! the calling thread once the lanes have joined.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Barrier;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::math;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ReductionMode {
    /// Rounds executed in order on the calling thread.
    #[default]
    Serial,
    /// One scoped thread per sub-state-element lane, a barrier per round.
    Barrier,
    /// One workgroup per particle on the GPU. Reduces on the calling thread
    /// instead when built without the `gpu` feature or when no device is
    /// available.
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxLogDensityKernel {
    n_active: usize,
    n_elements: usize,
    mode: ReductionMode,
}

#[inline]
fn sanitize(x: f64) -> f64 {
    if x.is_nan() {
        f64::NEG_INFINITY
    } else {
        x
    }
}

impl MaxLogDensityKernel {
    /// `n_active` bounds the particle index; it is fixed for the kernel's
    /// lifetime.
    pub fn new(n_active: usize, n_elements: usize, mode: ReductionMode) -> Self {
        Self {
            n_active,
            n_elements,
            mode,
        }
    }

    pub fn n_active(&self) -> usize {
        self.n_active
    }

    pub fn n_elements(&self) -> usize {
        self.n_elements
    }

    pub fn mode(&self) -> ReductionMode {
        self.mode
    }

    /// Sum `density(p, j)` over `j` for every particle `p < n_active`,
    /// writing totals into `out[..n_active]`. Entries beyond `n_active` are
    /// left untouched.
    pub fn reduce<F>(&self, density: F, out: &mut [f64])
    where
        F: Fn(usize, usize) -> f64 + Sync,
    {
        assert!(
            out.len() >= self.n_active,
            "output holds {} totals, kernel has {} active particles",
            out.len(),
            self.n_active
        );
        let out = &mut out[..self.n_active];
        if self.n_elements == 0 {
            out.iter_mut().for_each(|o| *o = 0.0);
            return;
        }
        match self.mode {
            ReductionMode::Serial => self.reduce_serial(&density, out),
            ReductionMode::Barrier => self.reduce_barrier(&density, out),
            ReductionMode::Gpu => self.reduce_gpu(&density, out),
        }
    }

    /// Reduce a row-major `n_active × n_elements` matrix of contributions.
    pub fn reduce_matrix(&self, contributions: &[f64], out: &mut [f64]) {
        assert!(contributions.len() >= self.n_active * self.n_elements);
        let m = self.n_elements;
        self.reduce(|p, j| contributions[p * m + j], out);
    }

    /// Largest per-particle total, `-inf` when none is finite.
    pub fn max(&self, totals: &[f64]) -> f64 {
        math::max_reduce(&totals[..self.n_active.min(totals.len())])
    }

    fn reduce_serial<F>(&self, density: &F, out: &mut [f64])
    where
        F: Fn(usize, usize) -> f64,
    {
        out.iter_mut().for_each(|o| *o = 0.0);
        for round in 0..self.n_elements {
            for (p, total) in out.iter_mut().enumerate() {
                *total += sanitize(density(p, round));
            }
        }
    }

    fn reduce_barrier<F>(&self, density: &F, out: &mut [f64])
    where
        F: Fn(usize, usize) -> f64 + Sync,
    {
        let n = self.n_active;
        let m = self.n_elements;
        let barrier = Barrier::new(m);
        let totals: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(0f64.to_bits())).collect();

        let lane = |j: usize| -> Option<Box<dyn Any + Send>> {
            let evaluated = panic::catch_unwind(AssertUnwindSafe(|| {
                (0..n).map(|p| sanitize(density(p, j))).collect::<Vec<f64>>()
            }));
            let (local, payload) = match evaluated {
                Ok(local) => (local, None),
                Err(payload) => (vec![f64::NEG_INFINITY; n], Some(payload)),
            };
            for round in 0..m {
                if round == j {
                    for (acc, v) in totals.iter().zip(&local) {
                        // sole writer this round; the barrier publishes it
                        let cur = f64::from_bits(acc.load(Ordering::Acquire));
                        acc.store((cur + v).to_bits(), Ordering::Release);
                    }
                }
                barrier.wait();
            }
            payload
        };

        let mut panics: Vec<Box<dyn Any + Send>> = Vec::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (1..m)
                .map(|j| {
                    let lane = &lane;
                    scope.spawn(move || lane(j))
                })
                .collect();
            panics.extend(lane(0));
            for handle in handles {
                match handle.join() {
                    Ok(payload) => panics.extend(payload),
                    Err(payload) => panics.push(payload),
                }
            }
            for (o, acc) in out.iter_mut().zip(&totals) {
                *o = f64::from_bits(acc.load(Ordering::Acquire));
            }
        });
        if let Some(payload) = panics.into_iter().next() {
            panic::resume_unwind(payload);
        }
    }

    #[cfg(feature = "gpu")]
    fn reduce_gpu<F>(&self, density: &F, out: &mut [f64])
    where
        F: Fn(usize, usize) -> f64,
    {
        let Some(gpu) = crate::gpu::shared() else {
            return self.reduce_serial(density, out);
        };
        let m = self.n_elements;
        let contributions: Vec<f64> = (0..self.n_active * m)
            .map(|i| sanitize(density(i / m, i % m)))
            .collect();
        match gpu.reduce(&contributions, self.n_active, m) {
            Ok(totals) => out.copy_from_slice(&totals),
            Err(e) => {
                warn!("GPU reduction failed, reducing on the CPU: {}", e);
                self.reduce_serial(density, out);
            }
        }
    }

    #[cfg(not(feature = "gpu"))]
    fn reduce_gpu<F>(&self, density: &F, out: &mut [f64])
    where
        F: Fn(usize, usize) -> f64,
    {
        static NOTICE: std::sync::Once = std::sync::Once::new();
        NOTICE.call_once(|| warn!("built without the gpu feature; GPU reductions run on the CPU"));
        self.reduce_serial(density, out);
    }
}
