//! Diagnostic population snapshots (`diagnostics` feature).
//!
//! Purely observational: one JSON file per schedule step, named
//! `sir{index_output}.json` (with a `.{rank}` suffix in multi-node runs).

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::comm::Communicator;
use crate::error::SamplerError;
use crate::output::PopulationSummary;
use crate::population::Population;

pub fn path<C: Communicator + ?Sized>(dir: &Path, index_output: usize, comm: &C) -> PathBuf {
    if comm.size() > 1 {
        dir.join(format!("sir{}.{}.json", index_output, comm.rank()))
    } else {
        dir.join(format!("sir{}.json", index_output))
    }
}

pub fn write<C, X, O>(
    dir: &Path,
    index_output: usize,
    comm: &C,
    population: &Population<X, O>,
) -> Result<PathBuf, SamplerError>
where
    C: Communicator + ?Sized,
{
    std::fs::create_dir_all(dir)?;
    let path = path(dir, index_output, comm);
    let writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(writer, &PopulationSummary::from_population(population))
        .map_err(|e| SamplerError::Output(e.to_string()))?;
    log::trace!("wrote snapshot {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::particle::ThetaParticle;

    #[test]
    fn test_snapshot_written_and_readable() {
        let dir = std::env::temp_dir().join(format!("smc2_snapshot_{}", std::process::id()));
        let pop: Population<(), ()> =
            Population::from_fn(2, |p| (ThetaParticle::new(vec![p as f64, 1.0], ()), ())).unwrap();
        let path = write(&dir, 7, &LocalComm, &pop).unwrap();
        assert!(path.ends_with("sir7.json"));
        let text = std::fs::read_to_string(&path).unwrap();
        let back: PopulationSummary = serde_json::from_str(&text).unwrap();
        assert_eq!(back.thetas[1], vec![1.0, 1.0]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
