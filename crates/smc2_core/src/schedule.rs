//! Time schedule
//!
//! An immutable, ordered sequence of time points. Each element is flagged as
//! observed or not and carries an output index. [`ScheduleIter`] is a cheap
//! `Copy` cursor; the terminal iterator returned by [`Schedule::end`] sits one
//! past the last element.

use core::ops::Deref;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("schedule must contain at least one element")]
    Empty,
    #[error("schedule time {0} is not finite")]
    NonFinite(f64),
    #[error("schedule times must be non-decreasing ({prev} followed by {next})")]
    Unordered { prev: f64, next: f64 },
}

/// One point of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleElement {
    pub time: f64,
    pub observed: bool,
    pub index_output: usize,
    /// Number of observed elements strictly before this one. For an observed
    /// element this is its own observation index.
    pub index_obs: usize,
}

impl ScheduleElement {
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn index_output(&self) -> usize {
        self.index_output
    }

    pub fn index_obs(&self) -> usize {
        self.index_obs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    elements: Vec<ScheduleElement>,
}

impl Schedule {
    /// Build from `(time, observed)` pairs in order. Output and observation
    /// indices are assigned here.
    pub fn from_points(points: &[(f64, bool)]) -> Result<Self, ScheduleError> {
        if points.is_empty() {
            return Err(ScheduleError::Empty);
        }
        let mut elements = Vec::with_capacity(points.len());
        let mut n_obs = 0;
        let mut prev = f64::NEG_INFINITY;
        for (k, &(time, observed)) in points.iter().enumerate() {
            if !time.is_finite() {
                return Err(ScheduleError::NonFinite(time));
            }
            if time < prev {
                return Err(ScheduleError::Unordered { prev, next: time });
            }
            prev = time;
            elements.push(ScheduleElement {
                time,
                observed,
                index_output: k,
                index_obs: n_obs,
            });
            if observed {
                n_obs += 1;
            }
        }
        Ok(Self { elements })
    }

    /// Merge a start time, output times and observation times into one
    /// schedule. Duplicate times collapse into a single element, observed if
    /// any source marked it observed.
    pub fn new(start: f64, output_times: &[f64], obs_times: &[f64]) -> Result<Self, ScheduleError> {
        let mut points: Vec<(f64, bool)> = Vec::with_capacity(1 + output_times.len() + obs_times.len());
        points.push((start, false));
        points.extend(output_times.iter().map(|&t| (t, false)));
        points.extend(obs_times.iter().map(|&t| (t, true)));
        if let Some(&(bad, _)) = points.iter().find(|(t, _)| !t.is_finite()) {
            return Err(ScheduleError::NonFinite(bad));
        }
        points.retain(|&(t, _)| t >= start);
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut merged: Vec<(f64, bool)> = Vec::with_capacity(points.len());
        for (t, obs) in points {
            match merged.last_mut() {
                Some(last) if last.0 == t => last.1 |= obs,
                _ => merged.push((t, obs)),
            }
        }
        Self::from_points(&merged)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[ScheduleElement] {
        &self.elements
    }

    pub fn num_observations(&self) -> usize {
        self.elements.iter().filter(|e| e.observed).count()
    }

    pub fn begin(&self) -> ScheduleIter<'_> {
        ScheduleIter { schedule: self, pos: 0 }
    }

    /// One past the last element.
    pub fn end(&self) -> ScheduleIter<'_> {
        ScheduleIter {
            schedule: self,
            pos: self.elements.len(),
        }
    }
}

/// Forward-only cursor into a [`Schedule`].
///
/// Dereferencing the terminal iterator panics, as does dereferencing past the
/// end; callers compare against [`Schedule::end`] first.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleIter<'a> {
    schedule: &'a Schedule,
    pos: usize,
}

impl<'a> ScheduleIter<'a> {
    pub fn get(&self) -> &'a ScheduleElement {
        &self.schedule.elements[self.pos]
    }

    pub fn try_get(&self) -> Option<&'a ScheduleElement> {
        self.schedule.elements.get(self.pos)
    }

    /// `self + n`, clamped to the terminal position.
    pub fn ahead(&self, n: usize) -> Self {
        Self {
            schedule: self.schedule,
            pos: (self.pos + n).min(self.schedule.elements.len()),
        }
    }

    pub fn advance(&mut self) {
        if self.pos < self.schedule.elements.len() {
            self.pos += 1;
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_end(&self) -> bool {
        self.pos >= self.schedule.elements.len()
    }

    /// `self + 1 == end`: the cursor is on the last element.
    pub fn is_last(&self) -> bool {
        self.pos + 1 >= self.schedule.elements.len()
    }

    pub fn schedule(&self) -> &'a Schedule {
        self.schedule
    }

    /// Elements in `[self, until)`.
    pub fn span(&self, until: &ScheduleIter<'a>) -> &'a [ScheduleElement] {
        let hi = until.pos.min(self.schedule.elements.len());
        let lo = self.pos.min(hi);
        &self.schedule.elements[lo..hi]
    }
}

impl Deref for ScheduleIter<'_> {
    type Target = ScheduleElement;

    fn deref(&self) -> &ScheduleElement {
        self.get()
    }
}

impl PartialEq for ScheduleIter<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.schedule, other.schedule) && self.pos == other.pos
    }
}

impl Eq for ScheduleIter<'_> {}
