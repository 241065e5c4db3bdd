//! Observation data: simulation and CSV exchange.

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use smc2_core::{FilterError, Schedule};

use crate::model::{Ar1Model, Ar1Params};

/// Replicate observations, indexed by observation index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observations {
    pub values: Vec<Vec<f64>>,
}

impl Observations {
    pub fn get(&self, index_obs: usize) -> Option<&[f64]> {
        self.values.get(index_obs).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A simulated trajectory and the observations drawn from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Simulated {
    /// Latent state at every schedule element.
    pub states: Vec<f64>,
    pub observations: Observations,
}

pub fn simulate<R: Rng + ?Sized>(
    model: &Ar1Model,
    theta: &[f64],
    schedule: &Schedule,
    rng: &mut R,
) -> Result<Simulated, FilterError> {
    let p = Ar1Params::from_theta(theta)?;
    if model.log_prior(theta) == f64::NEG_INFINITY {
        return Err(FilterError::InvalidInput(format!("{:?} is outside the prior support", theta)));
    }
    let mut states = Vec::with_capacity(schedule.len());
    let mut values = Vec::with_capacity(schedule.num_observations());
    let mut x = model.sample_initial(rng, &p)?;
    let mut prev_time = f64::NEG_INFINITY;
    for e in schedule.elements() {
        if states.is_empty() {
            prev_time = e.time;
        } else if e.time > prev_time {
            x = model.transition(rng, &p, x);
            prev_time = e.time;
        }
        states.push(x);
        if e.observed {
            values.push((0..model.replicates()).map(|_| model.sample_observation(rng, x)).collect());
        }
    }
    Ok(Simulated {
        states,
        observations: Observations { values },
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    index_obs: usize,
    time: f64,
    replicate: usize,
    value: f64,
}

/// One row per replicate: `index_obs,time,replicate,value`.
pub fn write_csv(path: &Path, schedule: &Schedule, observations: &Observations) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    let observed = schedule.elements().iter().filter(|e| e.observed);
    for (e, ys) in observed.zip(&observations.values) {
        for (replicate, &value) in ys.iter().enumerate() {
            writer.serialize(Row {
                index_obs: e.index_obs,
                time: e.time,
                replicate,
                value,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("observation {0} has no rows")]
    Missing(usize),
    #[error("observation {index_obs} has rows at times {first} and {second}")]
    ConflictingTime { index_obs: usize, first: f64, second: f64 },
    #[error("observation {index_obs} at time {time} does not follow time {prev}")]
    Unordered { index_obs: usize, time: f64, prev: f64 },
}

/// Read rows written by [`write_csv`]. Returns the observation times and the
/// replicates grouped by observation index.
///
/// Observation indices must be contiguous from 0 and their times strictly
/// increasing, so that a schedule built from the times assigns each
/// observation its own index.
pub fn read_csv(path: &Path) -> Result<(Vec<f64>, Observations), DataError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut times: Vec<Option<f64>> = Vec::new();
    let mut values: Vec<Vec<f64>> = Vec::new();
    for row in reader.deserialize() {
        let row: Row = row?;
        if values.len() <= row.index_obs {
            values.resize(row.index_obs + 1, Vec::new());
            times.resize(row.index_obs + 1, None);
        }
        let seen = times[row.index_obs];
        match seen {
            Some(first) if first != row.time => {
                return Err(DataError::ConflictingTime {
                    index_obs: row.index_obs,
                    first,
                    second: row.time,
                })
            }
            _ => times[row.index_obs] = Some(row.time),
        }
        values[row.index_obs].push(row.value);
    }

    let mut ordered: Vec<f64> = Vec::with_capacity(times.len());
    for (index_obs, time) in times.into_iter().enumerate() {
        let time = time.ok_or(DataError::Missing(index_obs))?;
        if let Some(&prev) = ordered.last() {
            if !(time > prev) {
                return Err(DataError::Unordered { index_obs, time, prev });
            }
        }
        ordered.push(time);
    }
    Ok((ordered, Observations { values }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_simulate_shapes() {
        let model = Ar1Model::new(&ModelConfig::default()).unwrap();
        let schedule = Schedule::new(0.0, &[0.5], &[1.0, 2.0, 3.0]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let sim = simulate(&model, &[1.0, 0.8, 0.3], &schedule, &mut rng).unwrap();
        assert_eq!(sim.states.len(), schedule.len());
        assert_eq!(sim.observations.len(), 3);
        assert!(sim.observations.values.iter().all(|ys| ys.len() == 4));
    }

    #[test]
    fn test_simulate_rejects_out_of_support() {
        let model = Ar1Model::new(&ModelConfig::default()).unwrap();
        let schedule = Schedule::new(0.0, &[], &[1.0]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert!(simulate(&model, &[0.0, 1.5, 1.0], &schedule, &mut rng).is_err());
    }

    #[test]
    fn test_csv_preserves_grouping() {
        let schedule = Schedule::new(0.0, &[], &[1.0, 2.0]).unwrap();
        let obs = Observations {
            values: vec![vec![0.5, 0.25], vec![-1.0, 2.0]],
        };
        let path = std::env::temp_dir().join(format!("smc2_obs_{}.csv", std::process::id()));
        write_csv(&path, &schedule, &obs).unwrap();
        let (times, back) = read_csv(&path).unwrap();
        assert_eq!(times, vec![1.0, 2.0]);
        assert_eq!(back, obs);
        let _ = std::fs::remove_file(&path);
    }

    fn read_rows(name: &str, rows: &str) -> Result<(Vec<f64>, Observations), DataError> {
        let path = std::env::temp_dir().join(format!("smc2_{}_{}.csv", name, std::process::id()));
        std::fs::write(&path, format!("index_obs,time,replicate,value\n{}", rows)).unwrap();
        let result = read_csv(&path);
        let _ = std::fs::remove_file(&path);
        result
    }

    #[test]
    fn test_csv_times_must_follow_index_order() {
        let err = read_rows("swapped", "0,2.0,0,100.0\n1,1.0,0,-100.0\n").unwrap_err();
        assert!(matches!(err, DataError::Unordered { index_obs: 1, .. }));
        let err = read_rows("repeated", "0,1.0,0,1.0\n1,1.0,0,2.0\n").unwrap_err();
        assert!(matches!(err, DataError::Unordered { index_obs: 1, .. }));
    }

    #[test]
    fn test_csv_rejects_gaps_and_conflicts() {
        let err = read_rows("gap", "0,1.0,0,1.0\n2,3.0,0,2.0\n").unwrap_err();
        assert!(matches!(err, DataError::Missing(1)));
        let err = read_rows("conflict", "0,1.0,0,1.0\n0,1.5,1,2.0\n").unwrap_err();
        assert!(matches!(err, DataError::ConflictingTime { index_obs: 0, .. }));
    }

    #[test]
    fn test_csv_rows_in_any_order_keep_their_index() {
        let (times, obs) = read_rows("shuffled", "1,2.0,0,-1.0\n0,1.0,0,5.0\n1,2.0,1,-2.0\n").unwrap();
        assert_eq!(times, vec![1.0, 2.0]);
        assert_eq!(obs.values, vec![vec![5.0], vec![-1.0, -2.0]]);
        let schedule = Schedule::new(0.0, &[], &times).unwrap();
        let observed: Vec<usize> = schedule.elements().iter().filter(|e| e.observed).map(|e| e.index_obs).collect();
        assert_eq!(observed, vec![0, 1]);
    }
}
