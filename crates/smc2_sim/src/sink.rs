//! JSON output of the final population.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use smc2_core::output::PopulationSummary;
use smc2_core::{OutputSink, Population, SamplerError};

use crate::filter::{LatentState, PathBuffer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub summary: PopulationSummary,
    pub times: Vec<f64>,
    /// Latent trajectory sampled for each parameter particle.
    pub paths: Vec<Vec<f64>>,
}

impl RunRecord {
    pub fn from_population(population: &Population<LatentState, PathBuffer>) -> Self {
        let times = population
            .outputs()
            .iter()
            .find(|o| !o.path.is_empty())
            .map(|o| o.times.clone())
            .unwrap_or_default();
        Self {
            summary: PopulationSummary::from_population(population),
            times,
            paths: population.outputs().iter().map(|o| o.path.clone()).collect(),
        }
    }

    pub fn read(path: &Path) -> Result<Self, SamplerError> {
        let file = File::open(path)?;
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| SamplerError::Output(e.to_string()))
    }
}

/// Writes each population handed to it as a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonSink {
    path: PathBuf,
    written: usize,
}

impl JsonSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl OutputSink<LatentState, PathBuffer> for JsonSink {
    fn clear(&mut self) {
        self.written = 0;
    }

    fn write(&mut self, population: &Population<LatentState, PathBuffer>) -> Result<(), SamplerError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(writer, &RunRecord::from_population(population))
            .map_err(|e| SamplerError::Output(e.to_string()))?;
        self.written += 1;
        log::debug!("wrote {} theta-particles to {}", population.size(), self.path.display());
        Ok(())
    }
}
