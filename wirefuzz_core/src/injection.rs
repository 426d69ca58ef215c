//! Per-block injection configuration for a learned structure.
//!
//! Every variable block gets an [`InjectionMethod`] (fresh random bytes or
//! lines from a library file). The [`InjectionMode`] decides whether all
//! variable blocks share one value per iteration or are filled independently.

use crate::block::{ProtocolBlock, ProtocolStructure};
use crate::progress::Total;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum InjectionError {
    #[error("Variable block {index} does not exist (structure has {count})")]
    NoSuchBlock { index: usize, count: usize },
    #[error("Library {path:?} is not readable: {source}")]
    LibraryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Library {0:?} is not a regular file")]
    NotARegularFile(PathBuf),
    #[error("Library {path:?} has an empty line at line {line}")]
    EmptyLine { path: PathBuf, line: usize },
    #[error("Library {0:?} contains no values")]
    EmptyLibrary(PathBuf),
    #[error("Variable block {0} uses library injection but has no valid library")]
    MissingLibrary(usize),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionMethod {
    #[default]
    Random,
    Library,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionMode {
    #[default]
    Simultaneous,
    Separate,
}

/// A validated library file: one candidate value per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    path: PathBuf,
    lines: Arc<[Vec<u8>]>,
}

impl Library {
    /// Loads a library. The file must be a readable regular file with at
    /// least one line and no empty lines. A single trailing newline is
    /// allowed, and `\r\n` line endings are accepted.
    pub fn load(path: &Path) -> Result<Self, InjectionError> {
        let metadata =
            std::fs::metadata(path).map_err(|source| InjectionError::LibraryUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        if !metadata.is_file() {
            return Err(InjectionError::NotARegularFile(path.to_path_buf()));
        }
        let content = std::fs::read(path).map_err(|source| InjectionError::LibraryUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let body = content.strip_suffix(b"\n").unwrap_or(&content);
        if body.is_empty() {
            return Err(InjectionError::EmptyLibrary(path.to_path_buf()));
        }
        let mut lines = Vec::new();
        for (n, raw) in body.split(|&b| b == b'\n').enumerate() {
            let line = raw.strip_suffix(b"\r").unwrap_or(raw);
            if line.is_empty() {
                return Err(InjectionError::EmptyLine {
                    path: path.to_path_buf(),
                    line: n + 1,
                });
            }
            lines.push(line.to_vec());
        }
        debug!("Loaded library {:?} with {} values", path, lines.len());
        Ok(Self {
            path: path.to_path_buf(),
            lines: lines.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> &[Vec<u8>] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct VarInjection {
    method: InjectionMethod,
    library: Option<Library>,
}

/// A [`ProtocolBlock`] plus, for variable blocks, how it is filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedProtocolBlock {
    block: ProtocolBlock,
    injection: Option<VarInjection>,
}

impl InjectedProtocolBlock {
    fn new(block: ProtocolBlock) -> Self {
        let injection = block.is_variable().then(VarInjection::default);
        Self { block, injection }
    }

    pub fn block(&self) -> &ProtocolBlock {
        &self.block
    }

    /// `None` for fixed blocks.
    pub fn method(&self) -> Option<InjectionMethod> {
        self.injection.as_ref().map(|i| i.method)
    }

    pub fn library(&self) -> Option<&Library> {
        self.injection.as_ref().and_then(|i| i.library.as_ref())
    }
}

/// Injection configuration over a whole structure.
///
/// Variable blocks are addressed by their position among variable blocks
/// only, so index 0 is always the first variable block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InjectedProtocolStructure {
    blocks: Vec<InjectedProtocolBlock>,
    variable: Vec<usize>,
    mode: InjectionMode,
}

impl InjectedProtocolStructure {
    /// Wraps every block; variable blocks start with random injection.
    pub fn from_structure(structure: &ProtocolStructure) -> Self {
        let blocks: Vec<InjectedProtocolBlock> = structure
            .blocks()
            .iter()
            .cloned()
            .map(InjectedProtocolBlock::new)
            .collect();
        let variable = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.block.is_variable())
            .map(|(i, _)| i)
            .collect();
        Self {
            blocks,
            variable,
            mode: InjectionMode::default(),
        }
    }

    pub fn blocks(&self) -> &[InjectedProtocolBlock] {
        &self.blocks
    }

    pub fn variable_blocks(&self) -> impl Iterator<Item = &InjectedProtocolBlock> {
        self.variable.iter().map(|&i| &self.blocks[i])
    }

    pub fn variable_block(&self, index: usize) -> Option<&InjectedProtocolBlock> {
        self.variable.get(index).map(|&i| &self.blocks[i])
    }

    pub fn variable_count(&self) -> usize {
        self.variable.len()
    }

    pub fn mode(&self) -> InjectionMode {
        self.mode
    }

    pub fn max_variable_length(&self) -> usize {
        self.variable_blocks()
            .map(|b| b.block.max_length())
            .max()
            .unwrap_or(0)
    }

    /// Removes every block.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.variable.clear();
    }

    fn injection_mut(&mut self, index: usize) -> Result<&mut VarInjection, InjectionError> {
        let count = self.variable.len();
        let block_index = *self
            .variable
            .get(index)
            .ok_or(InjectionError::NoSuchBlock { index, count })?;
        self.blocks[block_index]
            .injection
            .as_mut()
            .ok_or(InjectionError::NoSuchBlock { index, count })
    }

    /// Variable indices affected by a change at `index` under the current mode.
    fn targets(&self, index: usize) -> std::ops::Range<usize> {
        match self.mode {
            InjectionMode::Simultaneous => index..self.variable.len(),
            InjectionMode::Separate => index..index + 1,
        }
    }

    pub fn set_injection_method(
        &mut self,
        method: InjectionMethod,
        index: usize,
    ) -> Result<(), InjectionError> {
        self.injection_mut(index)?;
        for i in self.targets(index) {
            self.injection_mut(i)?.method = method;
        }
        Ok(())
    }

    /// Loads and assigns a library. On failure the affected blocks lose
    /// their library and the error is returned.
    pub fn set_library(&mut self, path: &Path, index: usize) -> Result<(), InjectionError> {
        self.injection_mut(index)?;
        let loaded = Library::load(path);
        if let Err(e) = &loaded {
            warn!("Rejected library for variable block {}: {}", index, e);
        }
        let library = loaded.as_ref().ok().cloned();
        for i in self.targets(index) {
            self.injection_mut(i)?.library = library.clone();
        }
        loaded.map(|_| ())
    }

    pub fn set_injection_mode(&mut self, mode: InjectionMode) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        match mode {
            InjectionMode::Separate => {
                // Blocks after the first no longer inherit the shared choice.
                for &i in self.variable.iter().skip(1) {
                    if let Some(injection) = self.blocks[i].injection.as_mut() {
                        *injection = VarInjection::default();
                    }
                }
            }
            InjectionMode::Simultaneous => {
                let Some(&first) = self.variable.first() else {
                    return;
                };
                let shared = self.blocks[first].injection.clone().unwrap_or_default();
                for &i in self.variable.iter().skip(1) {
                    self.blocks[i].injection = Some(shared.clone());
                }
            }
        }
    }

    /// Total number of messages the configuration can produce.
    ///
    /// Unbounded as soon as one variable block injects random data. Otherwise
    /// the first variable block's library size in simultaneous mode, or the
    /// sum of all library sizes in separate mode. A library block without a
    /// valid library contributes nothing.
    pub fn number_of_iterations(&self) -> Total {
        if self
            .variable_blocks()
            .any(|b| b.method() == Some(InjectionMethod::Random))
        {
            return Total::Unbounded;
        }
        let size = |b: &InjectedProtocolBlock| b.library().map_or(0, |l| l.len() as u64);
        match self.mode {
            InjectionMode::Simultaneous => {
                Total::Finite(self.variable_blocks().next().map_or(0, size))
            }
            InjectionMode::Separate => Total::Finite(self.variable_blocks().map(size).sum()),
        }
    }

    /// Checks every library-injected block has a usable library.
    pub fn validate(&self) -> Result<(), InjectionError> {
        for (index, block) in self.variable_blocks().enumerate() {
            if block.method() == Some(InjectionMethod::Library) && block.library().is_none() {
                return Err(InjectionError::MissingLibrary(index));
            }
        }
        Ok(())
    }
}
