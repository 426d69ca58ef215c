//! Global pairwise alignment of symbol sequences.
//!
//! Scoring follows Needleman–Wunsch with a uniform penalty: identical
//! positions score [`MATCH_SCORE`], substitutions and gaps both score
//! [`MISMATCH_SCORE`] / [`GAP_SCORE`]. The alignment itself is computed with
//! Hirschberg's divide-and-conquer recurrence so memory stays linear in the
//! length of the second sequence.
//!
//! The aligned pair is collapsed into a single merged sequence: a position
//! stays a concrete byte only when both sides carry the same byte there.

use crate::block::Symbol;
use std::cmp::Reverse;
use thiserror::Error;

pub const MATCH_SCORE: i64 = 1;
pub const MISMATCH_SCORE: i64 = -1;
pub const GAP_SCORE: i64 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlignError {
    #[error("Cannot align an empty {0} sequence")]
    EmptySequence(&'static str),
}

/// Result of aligning two sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    /// Merged sequence, one symbol per alignment column.
    pub merged: Vec<Symbol>,
    /// Optimal global alignment score.
    pub score: i64,
}

fn substitution(a: Symbol, b: Symbol) -> i64 {
    match (a, b) {
        (Symbol::Byte(x), Symbol::Byte(y)) if x == y => MATCH_SCORE,
        (Symbol::Wildcard, Symbol::Wildcard) => MATCH_SCORE,
        _ => MISMATCH_SCORE,
    }
}

fn check_inputs(a: &[Symbol], b: &[Symbol]) -> Result<(), AlignError> {
    if a.is_empty() {
        return Err(AlignError::EmptySequence("first"));
    }
    if b.is_empty() {
        return Err(AlignError::EmptySequence("second"));
    }
    Ok(())
}

/// Aligns `a` against `b` and returns the merged sequence.
pub fn align(a: &[Symbol], b: &[Symbol]) -> Result<Alignment, AlignError> {
    check_inputs(a, b)?;
    let mut merged = Vec::with_capacity(a.len().max(b.len()));
    hirschberg(a, b, &mut merged);
    let score = last_row(a, b)[b.len()];
    Ok(Alignment { merged, score })
}

/// Optimal global alignment score of `a` against `b`.
pub fn score(a: &[Symbol], b: &[Symbol]) -> Result<i64, AlignError> {
    check_inputs(a, b)?;
    Ok(last_row(a, b)[b.len()])
}

/// Alignment score normalised by the longer input, in `[-1.0, 1.0]`.
/// Identical sequences score exactly `1.0`.
pub fn similarity(a: &[Symbol], b: &[Symbol]) -> Result<f64, AlignError> {
    let raw = score(a, b)?;
    Ok(raw as f64 / a.len().max(b.len()) as f64)
}

/// Last row of the Needleman–Wunsch score matrix of `a` (rows) against `b`
/// (columns), kept in two rolling buffers.
fn last_row(a: &[Symbol], b: &[Symbol]) -> Vec<i64> {
    let m = b.len();
    let mut prev: Vec<i64> = (0..=m as i64).map(|j| j * GAP_SCORE).collect();
    let mut cur = vec![0i64; m + 1];
    for (i, &x) in a.iter().enumerate() {
        cur[0] = (i as i64 + 1) * GAP_SCORE;
        for j in 1..=m {
            let diag = prev[j - 1] + substitution(x, b[j - 1]);
            let up = prev[j] + GAP_SCORE;
            let left = cur[j - 1] + GAP_SCORE;
            cur[j] = diag.max(up).max(left);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev
}

fn hirschberg(a: &[Symbol], b: &[Symbol], out: &mut Vec<Symbol>) {
    if a.is_empty() {
        out.extend(std::iter::repeat_n(Symbol::Wildcard, b.len()));
        return;
    }
    if b.is_empty() {
        out.extend(std::iter::repeat_n(Symbol::Wildcard, a.len()));
        return;
    }
    if a.len() == 1 || b.len() == 1 {
        needleman_wunsch(a, b, out);
        return;
    }

    let mid = a.len() / 2;
    let upper = last_row(&a[..mid], b);
    let a_tail: Vec<Symbol> = a[mid..].iter().rev().copied().collect();
    let b_rev: Vec<Symbol> = b.iter().rev().copied().collect();
    let lower = last_row(&a_tail, &b_rev);

    let m = b.len();
    // Ties resolve to the smallest split column.
    let split = (0..=m)
        .max_by_key(|&j| (upper[j] + lower[m - j], Reverse(j)))
        .unwrap_or(0);

    hirschberg(&a[..mid], &b[..split], out);
    hirschberg(&a[mid..], &b[split..], out);
}

/// Full-matrix alignment with traceback, used for the small base cases.
///
/// Traceback prefers a diagonal step, then a gap in `b`, then a gap in `a`.
fn needleman_wunsch(a: &[Symbol], b: &[Symbol], out: &mut Vec<Symbol>) {
    let (n, m) = (a.len(), b.len());
    let mut h = vec![vec![0i64; m + 1]; n + 1];
    for (i, row) in h.iter_mut().enumerate() {
        row[0] = i as i64 * GAP_SCORE;
    }
    for j in 0..=m {
        h[0][j] = j as i64 * GAP_SCORE;
    }
    for i in 1..=n {
        for j in 1..=m {
            let diag = h[i - 1][j - 1] + substitution(a[i - 1], b[j - 1]);
            let up = h[i - 1][j] + GAP_SCORE;
            let left = h[i][j - 1] + GAP_SCORE;
            h[i][j] = diag.max(up).max(left);
        }
    }

    let mut columns = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && h[i][j] == h[i - 1][j - 1] + substitution(a[i - 1], b[j - 1]) {
            columns.push(a[i - 1].merge(b[j - 1]));
            i -= 1;
            j -= 1;
        } else if i > 0 && h[i][j] == h[i - 1][j] + GAP_SCORE {
            columns.push(Symbol::Wildcard);
            i -= 1;
        } else {
            columns.push(Symbol::Wildcard);
            j -= 1;
        }
    }
    out.extend(columns.into_iter().rev());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockKind, ProtocolStructure, symbols_from_bytes};

    fn merged(a: &[u8], b: &[u8]) -> Vec<Symbol> {
        align(&symbols_from_bytes(a), &symbols_from_bytes(b))
            .expect("alignment of non-empty inputs")
            .merged
    }

    #[test]
    fn aligning_with_itself_introduces_no_wildcards() {
        let seq = symbols_from_bytes(b"\x01\x02hello\xffworld");
        let result = align(&seq, &seq).unwrap();
        assert_eq!(result.merged, seq);
        assert_eq!(result.score, seq.len() as i64 * MATCH_SCORE);
    }

    #[test]
    fn self_alignment_keeps_existing_wildcards_in_place() {
        let mut seq = symbols_from_bytes(b"AB");
        seq.push(Symbol::Wildcard);
        seq.extend(symbols_from_bytes(b"CD"));
        assert_eq!(align(&seq, &seq).unwrap().merged, seq);
    }

    #[test]
    fn substituted_bytes_become_wildcards() {
        let m = merged(b"AABBCC", b"AAXXCC");
        let structure = ProtocolStructure::from_symbols(&m);
        let kinds: Vec<BlockKind> = structure.blocks().iter().map(|b| b.kind()).collect();
        assert_eq!(kinds, vec![BlockKind::Fix, BlockKind::Var, BlockKind::Fix]);
        assert_eq!(structure.blocks()[0].fixed_bytes(), b"AA");
        assert_eq!(structure.blocks()[1].max_length(), 2);
        assert_eq!(structure.blocks()[2].fixed_bytes(), b"CC");
    }

    #[test]
    fn insertion_becomes_wildcard_column() {
        let m = merged(b"ABC", b"ABXC");
        assert_eq!(
            m,
            vec![
                Symbol::Byte(b'A'),
                Symbol::Byte(b'B'),
                Symbol::Wildcard,
                Symbol::Byte(b'C')
            ]
        );
    }

    fn is_subsequence(needle: &[u8], haystack: &[u8]) -> bool {
        let mut rest = haystack.iter();
        needle.iter().all(|n| rest.any(|h| h == n))
    }

    #[test]
    fn linear_space_alignment_is_a_valid_global_alignment() {
        let pairs: [(&[u8], &[u8]); 4] = [
            (b"GET /index.html HTTP/1.0", b"GET /a HTTP/1.1"),
            (b"\x00\x01\x02\x03\x04\x05", b"\x00\x02\x04"),
            (b"hello world", b"yellow word"),
            (b"abcdefgh", b"hgfedcba"),
        ];
        for (raw_a, raw_b) in pairs {
            let a = symbols_from_bytes(raw_a);
            let b = symbols_from_bytes(raw_b);
            let result = align(&a, &b).unwrap();
            let fixed: Vec<u8> = result.merged.iter().filter_map(|s| s.byte()).collect();

            assert!(result.merged.len() >= a.len().max(b.len()));
            assert!(result.merged.len() <= a.len() + b.len());
            assert!(is_subsequence(&fixed, raw_a), "{fixed:?} not in {raw_a:?}");
            assert!(is_subsequence(&fixed, raw_b), "{fixed:?} not in {raw_b:?}");

            let mut full = Vec::new();
            needleman_wunsch(&a, &b, &mut full);
            assert!(full.len() >= a.len().max(b.len()));
            assert_eq!(result.score, last_row(&a, &b)[b.len()]);
        }
    }

    #[test]
    fn alignment_is_deterministic() {
        let a = symbols_from_bytes(b"abab");
        let b = symbols_from_bytes(b"baba");
        let first = align(&a, &b).unwrap();
        let second = align(&a, &b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn shared_bytes_stay_fixed_and_differences_become_wildcards() {
        let m = merged(b"\x10\x20\x30\x40", b"\x10\x21\x30\x40");
        assert_eq!(m[0], Symbol::Byte(0x10));
        assert_eq!(m[1], Symbol::Wildcard);
        assert_eq!(m[2], Symbol::Byte(0x30));
        assert_eq!(m[3], Symbol::Byte(0x40));
    }

    #[test]
    fn empty_input_is_rejected() {
        let seq = symbols_from_bytes(b"abc");
        assert_eq!(align(&[], &seq), Err(AlignError::EmptySequence("first")));
        assert_eq!(align(&seq, &[]), Err(AlignError::EmptySequence("second")));
        assert!(score(&[], &[]).is_err());
    }

    #[test]
    fn similarity_of_identical_sequences_is_one() {
        let seq = symbols_from_bytes(b"protocol");
        assert_eq!(similarity(&seq, &seq).unwrap(), 1.0);
        let other = symbols_from_bytes(b"PROTOCOL");
        assert!(similarity(&seq, &other).unwrap() < 0.0);
    }
}
