use serde::{Deserialize, Serialize};
use std::fmt;

/// One position of an aligned sequence: either a byte every sample agreed on,
/// or a wildcard where the samples differed or one of them had no byte at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Byte(u8),
    Wildcard,
}

impl Symbol {
    pub fn is_wildcard(self) -> bool {
        matches!(self, Symbol::Wildcard)
    }

    pub fn byte(self) -> Option<u8> {
        match self {
            Symbol::Byte(b) => Some(b),
            Symbol::Wildcard => None,
        }
    }

    /// Merges two aligned positions. Only identical bytes survive.
    pub fn merge(self, other: Symbol) -> Symbol {
        match (self, other) {
            (Symbol::Byte(a), Symbol::Byte(b)) if a == b => Symbol::Byte(a),
            _ => Symbol::Wildcard,
        }
    }
}

impl From<u8> for Symbol {
    fn from(b: u8) -> Self {
        Symbol::Byte(b)
    }
}

/// Lifts raw capture bytes into a sequence of concrete symbols.
pub fn symbols_from_bytes(bytes: &[u8]) -> Vec<Symbol> {
    bytes.iter().copied().map(Symbol::Byte).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    Fix,
    Var,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Fix => write!(f, "FIX"),
            BlockKind::Var => write!(f, "VAR"),
        }
    }
}

/// A maximal run of either fixed bytes or wildcard slots.
///
/// For `Fix` blocks every symbol is a byte and both lengths equal the byte
/// count. For `Var` blocks every symbol is a wildcard and the lengths record
/// the slot count observed when the block was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolBlock {
    kind: BlockKind,
    min_length: usize,
    max_length: usize,
    symbols: Vec<Symbol>,
}

impl ProtocolBlock {
    /// Builds a block from a homogeneous run. Returns `None` for an empty run
    /// or one that mixes bytes and wildcards.
    pub fn from_run(run: &[Symbol]) -> Option<Self> {
        let first = run.first()?;
        let kind = if first.is_wildcard() {
            BlockKind::Var
        } else {
            BlockKind::Fix
        };
        if run.iter().any(|s| s.is_wildcard() != first.is_wildcard()) {
            return None;
        }
        Some(Self {
            kind,
            min_length: run.len(),
            max_length: run.len(),
            symbols: run.to_vec(),
        })
    }

    pub fn fixed(bytes: &[u8]) -> Option<Self> {
        Self::from_run(&symbols_from_bytes(bytes))
    }

    pub fn variable(length: usize) -> Option<Self> {
        Self::from_run(&vec![Symbol::Wildcard; length])
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn is_variable(&self) -> bool {
        self.kind == BlockKind::Var
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// The literal content of a `Fix` block. Empty for `Var` blocks.
    pub fn fixed_bytes(&self) -> Vec<u8> {
        self.symbols.iter().filter_map(|s| s.byte()).collect()
    }
}

/// Ordered list of blocks learned from a set of captures.
///
/// Adjacent blocks never share a kind: a run appended next to a block of the
/// same kind is folded into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolStructure {
    blocks: Vec<ProtocolBlock>,
}

impl ProtocolStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits an aligned sequence into maximal runs, left to right.
    pub fn from_symbols(symbols: &[Symbol]) -> Self {
        let mut structure = Self::new();
        for run in symbols.chunk_by(|a, b| a.is_wildcard() == b.is_wildcard()) {
            structure.add_block(run);
        }
        structure
    }

    /// Appends a homogeneous run. A run that mixes bytes and wildcards is
    /// ignored and `false` is returned.
    pub fn add_block(&mut self, run: &[Symbol]) -> bool {
        let Some(block) = ProtocolBlock::from_run(run) else {
            return false;
        };
        match self.blocks.last_mut() {
            Some(last) if last.kind == block.kind => {
                last.symbols.extend_from_slice(&block.symbols);
                last.min_length = last.symbols.len();
                last.max_length = last.symbols.len();
            }
            _ => self.blocks.push(block),
        }
        true
    }

    pub fn blocks(&self) -> &[ProtocolBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn variable_blocks(&self) -> impl Iterator<Item = &ProtocolBlock> {
        self.blocks.iter().filter(|b| b.is_variable())
    }
}

impl fmt::Display for ProtocolStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .blocks
            .iter()
            .map(|b| match b.kind {
                BlockKind::Fix => format!("FIX({})", hex::encode(b.fixed_bytes())),
                BlockKind::Var => format!("VAR({})", b.max_length),
            })
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
