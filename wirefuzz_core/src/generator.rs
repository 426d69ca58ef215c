use crate::injection::{InjectedProtocolStructure, InjectionError, InjectionMethod, InjectionMode};
use crate::progress::Total;
use crate::random::RandomSource;

/// In simultaneous random mode one draw fills every variable slot, and its
/// length is bounded by this factor times the longest variable block.
pub const SIMULTANEOUS_RANDOM_FACTOR: usize = 10_000;

/// Produces one fuzzed message per call from an injection configuration.
///
/// Fixed blocks always contribute their bytes unchanged. Variable blocks are
/// filled according to the configured mode and methods:
///
/// * simultaneous/random: one random string copied into every slot;
/// * simultaneous/library: the next line of the first variable block's
///   library copied into every slot;
/// * separate/random: an independent draw per block, bounded by the block's
///   own maximum length;
/// * separate/library: one block walks its library line by line while the
///   others get filler values, then the walk moves to the next library block.
#[derive(Debug)]
pub struct MessageGenerator {
    structure: InjectedProtocolStructure,
    random: RandomSource,
    library_order: Vec<usize>,
    active: usize,
    line: usize,
    generated: u64,
}

impl MessageGenerator {
    /// Takes a snapshot of the configuration. Fails when a library block
    /// has no usable library.
    pub fn new(
        structure: InjectedProtocolStructure,
        random: RandomSource,
    ) -> Result<Self, InjectionError> {
        structure.validate()?;
        let library_order = structure
            .variable_blocks()
            .enumerate()
            .filter(|(_, b)| b.method() == Some(InjectionMethod::Library))
            .map(|(i, _)| i)
            .collect();
        Ok(Self {
            structure,
            random,
            library_order,
            active: 0,
            line: 0,
            generated: 0,
        })
    }

    pub fn iterations(&self) -> Total {
        self.structure.number_of_iterations()
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }

    pub fn structure(&self) -> &InjectedProtocolStructure {
        &self.structure
    }

    /// Next message, or `None` once every library has been exhausted.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        let values = match self.structure.mode() {
            InjectionMode::Simultaneous => self.simultaneous_values()?,
            InjectionMode::Separate => self.separate_values()?,
        };
        self.generated += 1;
        Some(self.assemble(&values))
    }

    fn simultaneous_values(&mut self) -> Option<Vec<Vec<u8>>> {
        let first = self.structure.variable_block(0)?;
        let value = match first.method()? {
            InjectionMethod::Random => self
                .random
                .bytes_up_to(SIMULTANEOUS_RANDOM_FACTOR * self.structure.max_variable_length()),
            InjectionMethod::Library => {
                let value = first.library()?.lines().get(self.line)?.clone();
                self.line += 1;
                value
            }
        };
        Some(vec![value; self.structure.variable_count()])
    }

    fn separate_values(&mut self) -> Option<Vec<Vec<u8>>> {
        while let Some(&index) = self.library_order.get(self.active) {
            let len = self
                .structure
                .variable_block(index)
                .and_then(|b| b.library())
                .map_or(0, |l| l.len());
            if self.line < len {
                break;
            }
            self.active += 1;
            self.line = 0;
        }
        let active = self.library_order.get(self.active).copied();
        let has_random = self.library_order.len() < self.structure.variable_count();
        if active.is_none() && !has_random {
            return None;
        }

        let mut values = Vec::with_capacity(self.structure.variable_count());
        for (index, block) in self.structure.variable_blocks().enumerate() {
            let value = match (block.method(), block.library()) {
                (_, Some(library)) if Some(index) == active => library.lines()[self.line].clone(),
                (Some(InjectionMethod::Library), Some(library)) if !library.is_empty() => {
                    library.lines()[self.random.index(library.len())].clone()
                }
                _ => self.random.bytes_up_to(block.block().max_length()),
            };
            values.push(value);
        }
        if active.is_some() {
            self.line += 1;
        }
        Some(values)
    }

    fn assemble(&self, values: &[Vec<u8>]) -> Vec<u8> {
        let mut message = Vec::new();
        let mut next_value = values.iter();
        for block in self.structure.blocks() {
            if block.block().is_variable() {
                if let Some(value) = next_value.next() {
                    message.extend_from_slice(value);
                }
            } else {
                message.extend(block.block().fixed_bytes());
            }
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ProtocolStructure, Symbol, symbols_from_bytes};
    use std::collections::HashSet;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn structure(parts: &[Result<&[u8], usize>]) -> InjectedProtocolStructure {
        let mut seq = Vec::new();
        for part in parts {
            match part {
                Ok(bytes) => seq.extend(symbols_from_bytes(bytes)),
                Err(len) => seq.extend(std::iter::repeat_n(Symbol::Wildcard, *len)),
            }
        }
        InjectedProtocolStructure::from_structure(&ProtocolStructure::from_symbols(&seq))
    }

    fn library_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn library_of_five_lines_yields_five_messages() {
        let mut s = structure(&[Ok(b"<"), Err(3), Ok(b">")]);
        let lib = library_file(b"one\ntwo\nsix\nten\nabc\n");
        s.set_injection_method(InjectionMethod::Library, 0).unwrap();
        s.set_library(lib.path(), 0).unwrap();

        let mut generator = MessageGenerator::new(s, RandomSource::from_seed(1)).unwrap();
        assert_eq!(generator.iterations(), Total::Finite(5));

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let message = generator.next_message().expect("library not yet exhausted");
            assert!(message.starts_with(b"<") && message.ends_with(b">"));
            seen.insert(message);
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.contains(&b"<six>".to_vec()));
        assert_eq!(generator.next_message(), None);
        assert_eq!(generator.generated(), 5);
    }

    #[test]
    fn simultaneous_random_copies_one_draw_into_every_slot() {
        let s = structure(&[Ok(b"A"), Err(2), Ok(b"B"), Err(1), Ok(b"C")]);
        let mut generator = MessageGenerator::new(s, RandomSource::from_seed(3)).unwrap();
        assert_eq!(generator.iterations(), Total::Unbounded);

        for _ in 0..20 {
            let m = generator.next_message().unwrap();
            let l = (m.len() - 3) / 2;
            assert!(l >= 1 && l <= SIMULTANEOUS_RANDOM_FACTOR * 2);
            assert_eq!(m[0], b'A');
            assert_eq!(m[1 + l], b'B');
            assert_eq!(m[1..1 + l], m[2 + l..2 + 2 * l]);
            assert_eq!(*m.last().unwrap(), b'C');
        }
    }

    #[test]
    fn simultaneous_library_shares_line_across_slots() {
        let mut s = structure(&[Err(2), Ok(b"-"), Err(4)]);
        let lib = library_file(b"xy\nzw\n");
        s.set_injection_method(InjectionMethod::Library, 0).unwrap();
        s.set_library(lib.path(), 0).unwrap();
        let mut generator = MessageGenerator::new(s, RandomSource::from_seed(3)).unwrap();
        assert_eq!(generator.next_message().unwrap(), b"xy-xy");
        assert_eq!(generator.next_message().unwrap(), b"zw-zw");
        assert_eq!(generator.next_message(), None);
    }

    #[test]
    fn separate_random_respects_each_block_length() {
        let mut s = structure(&[Ok(b"["), Err(2), Ok(b"|"), Err(5), Ok(b"]")]);
        s.set_injection_mode(InjectionMode::Separate);
        let mut generator = MessageGenerator::new(s, RandomSource::from_seed(5)).unwrap();
        for _ in 0..50 {
            let m = generator.next_message().unwrap();
            assert!(m.len() >= 3 + 2 && m.len() <= 3 + 2 + 5, "length {}", m.len());
        }
    }

    #[test]
    fn separate_library_walks_one_block_at_a_time() {
        let mut s = structure(&[Ok(b"["), Err(2), Ok(b"|"), Err(2), Ok(b"]")]);
        s.set_injection_mode(InjectionMode::Separate);
        let first = library_file(b"a1\na2\n");
        let second = library_file(b"b1\nb2\nb3\n");
        for (i, lib) in [(0, &first), (1, &second)] {
            s.set_injection_method(InjectionMethod::Library, i).unwrap();
            s.set_library(lib.path(), i).unwrap();
        }

        let mut generator = MessageGenerator::new(s, RandomSource::from_seed(11)).unwrap();
        assert_eq!(generator.iterations(), Total::Finite(5));

        let mut pairs = Vec::new();
        while let Some(m) = generator.next_message() {
            let inner = &m[1..m.len() - 1];
            let mut split = inner.split(|&b| b == b'|');
            let left = split.next().unwrap().to_vec();
            let right = split.next().unwrap().to_vec();
            pairs.push((left, right));
        }
        assert_eq!(pairs.len(), 5);

        assert_eq!(pairs[0].0, b"a1");
        assert_eq!(pairs[1].0, b"a2");
        for (_, filler) in &pairs[..2] {
            assert!(filler.starts_with(b"b"), "filler {filler:?}");
        }
        assert_eq!(pairs[2].1, b"b1");
        assert_eq!(pairs[3].1, b"b2");
        assert_eq!(pairs[4].1, b"b3");
        for (filler, _) in &pairs[2..] {
            assert!(filler.starts_with(b"a"), "filler {filler:?}");
        }
    }

    #[test]
    fn separate_mixed_methods_never_run_out() {
        let mut s = structure(&[Err(1), Ok(b"|"), Err(1)]);
        s.set_injection_mode(InjectionMode::Separate);
        let lib = library_file(b"L\n");
        s.set_injection_method(InjectionMethod::Library, 0).unwrap();
        s.set_library(lib.path(), 0).unwrap();

        let mut generator = MessageGenerator::new(s, RandomSource::from_seed(2)).unwrap();
        assert_eq!(generator.iterations(), Total::Unbounded);
        for _ in 0..10 {
            let m = generator.next_message().unwrap();
            assert_eq!(m[0], b'L');
        }
    }

    #[test]
    fn library_block_without_library_is_rejected() {
        let mut s = structure(&[Err(1)]);
        s.set_injection_method(InjectionMethod::Library, 0).unwrap();
        assert!(matches!(
            MessageGenerator::new(s, RandomSource::from_seed(0)),
            Err(InjectionError::MissingLibrary(0))
        ));
    }

    #[test]
    fn structure_without_variable_blocks_is_empty() {
        let s = structure(&[Ok(b"static")]);
        let mut generator = MessageGenerator::new(s, RandomSource::from_seed(0)).unwrap();
        assert_eq!(generator.iterations(), Total::Finite(0));
        assert_eq!(generator.next_message(), None);
    }
}
