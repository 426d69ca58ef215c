use crate::block::{BlockKind, ProtocolStructure, Symbol};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Structure I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Structure document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Block {index} has invalid hex content: {source}")]
    Hex {
        index: usize,
        #[source]
        source: hex::FromHexError,
    },
    #[error("Block {0} is empty")]
    EmptyBlock(usize),
}

/// One block of the exchanged document. Fixed blocks carry hex-encoded
/// bytes, variable blocks only their length.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BlockEntry {
    Fix { bytes: String },
    Var { length: usize },
}

/// Serializable form of a learned structure, handed to export and report
/// collaborators and read back by the fuzzing workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StructureDocument {
    pub timestamp: String,
    pub blocks: Vec<BlockEntry>,
}

impl StructureDocument {
    pub fn from_structure(structure: &ProtocolStructure) -> Self {
        let blocks = structure
            .blocks()
            .iter()
            .map(|block| match block.kind() {
                BlockKind::Fix => BlockEntry::Fix {
                    bytes: hex::encode(block.fixed_bytes()),
                },
                BlockKind::Var => BlockEntry::Var {
                    length: block.max_length(),
                },
            })
            .collect();
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            blocks,
        }
    }

    pub fn to_structure(&self) -> Result<ProtocolStructure, ExportError> {
        let mut structure = ProtocolStructure::new();
        for (index, entry) in self.blocks.iter().enumerate() {
            let run: Vec<Symbol> = match entry {
                BlockEntry::Fix { bytes } => hex::decode(bytes)
                    .map_err(|source| ExportError::Hex { index, source })?
                    .into_iter()
                    .map(Symbol::Byte)
                    .collect(),
                BlockEntry::Var { length } => vec![Symbol::Wildcard; *length],
            };
            if !structure.add_block(&run) {
                return Err(ExportError::EmptyBlock(index));
            }
        }
        Ok(structure)
    }

    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ExportError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ExportError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, ExportError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::symbols_from_bytes;

    fn sample() -> ProtocolStructure {
        let mut seq = symbols_from_bytes(b"\x01\xfe");
        seq.extend([Symbol::Wildcard; 3]);
        seq.extend(symbols_from_bytes(b"END"));
        ProtocolStructure::from_symbols(&seq)
    }

    #[test]
    fn document_carries_hex_and_lengths() {
        let doc = StructureDocument::from_structure(&sample());
        assert_eq!(
            doc.blocks,
            vec![
                BlockEntry::Fix {
                    bytes: "01fe".to_string()
                },
                BlockEntry::Var { length: 3 },
                BlockEntry::Fix {
                    bytes: "454e44".to_string()
                },
            ]
        );
        assert!(chrono::DateTime::parse_from_rfc3339(&doc.timestamp).is_ok());
    }

    #[test]
    fn document_rebuilds_the_structure() {
        let structure = sample();
        let json = StructureDocument::from_structure(&structure)
            .to_json()
            .unwrap();
        assert!(json.contains("\"kind\": \"var\""));
        let rebuilt = StructureDocument::from_json(&json)
            .unwrap()
            .to_structure()
            .unwrap();
        assert_eq!(rebuilt, structure);
    }

    #[test]
    fn invalid_blocks_are_reported_with_their_index() {
        let doc = StructureDocument {
            timestamp: String::new(),
            blocks: vec![
                BlockEntry::Fix {
                    bytes: "00".to_string(),
                },
                BlockEntry::Fix {
                    bytes: "zz".to_string(),
                },
            ],
        };
        assert!(matches!(
            doc.to_structure(),
            Err(ExportError::Hex { index: 1, .. })
        ));

        let empty = StructureDocument {
            timestamp: String::new(),
            blocks: vec![BlockEntry::Var { length: 0 }],
        };
        assert!(matches!(empty.to_structure(), Err(ExportError::EmptyBlock(0))));
    }
}
