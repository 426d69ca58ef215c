//! Progressive alignment of captured messages into a [`ProtocolStructure`].
//!
//! The learner repeatedly picks the two most similar sequences, aligns them,
//! and replaces the pair with the merged result until one sequence remains.
//! Every step runs as a cancellable unit on the [`WorkerPool`] and reports
//! progress through an [`EventSink`].
//!
//! Closest pair: the pair with the highest [`align::similarity`] (alignment
//! score divided by the longer length). Ties go to the lowest first index,
//! then the lowest second index. The merged sequence takes the place of the
//! first sequence of the pair.
//!
//! Adjust pass: a single concrete byte with a wildcard on both sides is turned
//! into a wildcard.

use crate::align::{self, AlignError};
use crate::block::{ProtocolStructure, Symbol, symbols_from_bytes};
use crate::pool::{PoolError, WorkerPool};
use crate::progress::{EventSink, Progress, Total};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LearnError {
    #[error("At least 2 non-empty captures are required, got {0}")]
    NotEnoughCaptures(usize),
    #[error("Failed to read capture {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Capture {0:?} is not a regular file")]
    NotAFile(PathBuf),
    #[error("Alignment failed: {0}")]
    Align(#[from] AlignError),
    #[error("Learning was canceled")]
    Canceled,
    #[error("Learner worker failed: {0}")]
    Worker(String),
}

impl From<PoolError> for LearnError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Canceled => LearnError::Canceled,
            other => LearnError::Worker(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnEvent {
    Progress(Progress),
    /// Structure extracted from the latest merge.
    Structure(ProtocolStructure),
    Finished(ProtocolStructure),
    Canceled,
}

/// Reads raw capture files. Empty captures are skipped.
pub fn read_captures<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Vec<u8>>, LearnError> {
    let mut captures = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|source| LearnError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(LearnError::NotAFile(path.to_path_buf()));
        }
        let data = std::fs::read(path).map_err(|source| LearnError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if data.is_empty() {
            warn!("Skipping empty capture {:?}", path);
            continue;
        }
        debug!(
            "Loaded capture {:?} ({} bytes, md5 {:x})",
            path,
            data.len(),
            md5::compute(&data)
        );
        captures.push(data);
    }
    Ok(captures)
}

/// Number of work units for `n` non-empty captures: conversion, then one
/// selection, merge and block extraction per merge, then adjust and final
/// extraction.
pub fn total_units(n: usize) -> u64 {
    let merges = n.saturating_sub(1) as u64;
    1 + 3 * merges + 2
}

/// Turns isolated single-byte fixed runs between wildcards into wildcards.
pub fn adjust(seq: &[Symbol]) -> Vec<Symbol> {
    let mut out = seq.to_vec();
    for (i, window) in seq.windows(3).enumerate() {
        if window[0].is_wildcard() && !window[1].is_wildcard() && window[2].is_wildcard() {
            out[i + 1] = Symbol::Wildcard;
        }
    }
    out
}

/// Pairwise similarities of the sequences still waiting to be merged.
///
/// Only the merged sequence's row is recomputed after a merge, so each
/// selection after the first costs one alignment score per remaining sequence.
#[derive(Debug, Clone, PartialEq)]
struct ScoreTable {
    scores: Vec<Vec<f64>>,
}

impl ScoreTable {
    fn build(seqs: &[Arc<[Symbol]>]) -> Result<Self, AlignError> {
        let n = seqs.len();
        let mut scores = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let sim = align::similarity(&seqs[i], &seqs[j])?;
                scores[i][j] = sim;
                scores[j][i] = sim;
            }
        }
        Ok(Self { scores })
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    /// Index pair of the most similar sequences, lowest indices on ties.
    fn closest_pair(&self) -> (usize, usize) {
        let mut best: Option<(f64, usize, usize)> = None;
        for (i, row) in self.scores.iter().enumerate() {
            for (j, &sim) in row.iter().enumerate().skip(i + 1) {
                if best.is_none_or(|(best_sim, _, _)| sim > best_sim) {
                    best = Some((sim, i, j));
                }
            }
        }
        best.map(|(_, i, j)| (i, j)).unwrap_or((0, 1))
    }

    /// Updates the table after `seqs[i]` took the merge of `i` and `j` and
    /// `seqs[j]` was removed. Requires `i < j`.
    fn merge(&mut self, seqs: &[Arc<[Symbol]>], i: usize, j: usize) -> Result<(), AlignError> {
        self.scores.remove(j);
        for row in &mut self.scores {
            row.remove(j);
        }
        for k in 0..seqs.len() {
            if k == i {
                continue;
            }
            let sim = align::similarity(&seqs[i], &seqs[k])?;
            self.scores[i][k] = sim;
            self.scores[k][i] = sim;
        }
        Ok(())
    }
}

/// Index pair of the most similar sequences, lowest indices on ties.
fn closest_pair(seqs: &[Arc<[Symbol]>]) -> Result<(usize, usize), AlignError> {
    Ok(ScoreTable::build(seqs)?.closest_pair())
}

struct Tracker<'a> {
    done: u64,
    total: Total,
    events: &'a EventSink<LearnEvent>,
}

impl Tracker<'_> {
    fn step(&mut self) {
        self.done += 1;
        self.events.emit(LearnEvent::Progress(Progress {
            done: self.done,
            total: self.total,
        }));
    }
}

pub struct StructureLearner {
    pool: WorkerPool,
}

impl StructureLearner {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    /// Learns a structure from raw captures.
    ///
    /// On cancellation a [`LearnEvent::Canceled`] is emitted and
    /// [`LearnError::Canceled`] returned.
    pub async fn learn(
        &self,
        captures: Vec<Vec<u8>>,
        cancel: &CancellationToken,
        events: &EventSink<LearnEvent>,
    ) -> Result<ProtocolStructure, LearnError> {
        let result = self.learn_inner(captures, cancel, events).await;
        match &result {
            Ok(structure) => {
                info!("Learned structure with {} blocks", structure.len());
                events.emit(LearnEvent::Finished(structure.clone()));
            }
            Err(LearnError::Canceled) => {
                info!("Structure learning canceled");
                events.emit(LearnEvent::Canceled);
            }
            Err(_) => {}
        }
        result
    }

    async fn learn_inner(
        &self,
        captures: Vec<Vec<u8>>,
        cancel: &CancellationToken,
        events: &EventSink<LearnEvent>,
    ) -> Result<ProtocolStructure, LearnError> {
        let non_empty = captures.iter().filter(|c| !c.is_empty()).count();
        if non_empty < 2 {
            return Err(LearnError::NotEnoughCaptures(non_empty));
        }
        let mut tracker = Tracker {
            done: 0,
            total: Total::Finite(total_units(non_empty)),
            events,
        };

        let mut seqs: Vec<Arc<[Symbol]>> = self
            .pool
            .run(cancel, move || {
                captures
                    .iter()
                    .filter(|c| !c.is_empty())
                    .map(|c| Arc::from(symbols_from_bytes(c)))
                    .collect()
            })
            .await?;
        tracker.step();

        let mut table: Option<ScoreTable> = None;
        let mut last_merge: Option<(usize, usize)> = None;
        while seqs.len() > 1 {
            let snapshot = seqs.clone();
            let cached = table.take();
            let (updated, (i, j)) = self
                .pool
                .run(cancel, move || {
                    let table = match (cached, last_merge) {
                        (Some(mut table), Some((i, j))) => {
                            table.merge(&snapshot, i, j)?;
                            table
                        }
                        _ => ScoreTable::build(&snapshot)?,
                    };
                    let pair = table.closest_pair();
                    Ok::<_, AlignError>((table, pair))
                })
                .await??;
            table = Some(updated);
            last_merge = Some((i, j));
            tracker.step();

            let (a, b) = (Arc::clone(&seqs[i]), Arc::clone(&seqs[j]));
            let alignment = self.pool.run(cancel, move || align::align(&a, &b)).await??;
            debug!(
                "Merged sequences {} and {} (score {}, {} columns)",
                i,
                j,
                alignment.score,
                alignment.merged.len()
            );
            let merged: Arc<[Symbol]> = Arc::from(alignment.merged);
            seqs[i] = Arc::clone(&merged);
            seqs.remove(j);
            tracker.step();

            let structure = self
                .pool
                .run(cancel, move || ProtocolStructure::from_symbols(&merged))
                .await?;
            events.emit(LearnEvent::Structure(structure));
            tracker.step();
        }

        let last = Arc::clone(&seqs[0]);
        let adjusted = self.pool.run(cancel, move || adjust(&last)).await?;
        tracker.step();

        let structure = self
            .pool
            .run(cancel, move || ProtocolStructure::from_symbols(&adjusted))
            .await?;
        tracker.step();
        Ok(structure)
    }
}
