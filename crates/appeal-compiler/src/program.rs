//! Assembled Charm programs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};

use appeal_core::OptionKey;

use crate::instruction::Instruction;

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// Aggregate argument counts for a whole program.
///
/// `maximum` is `None` for programs containing a repeating group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgTally {
    pub minimum: usize,
    pub maximum: Option<usize>,
}

impl ArgTally {
    /// Render the count the way usage errors spell it.
    pub fn describe(&self) -> String {
        let plural = |n: usize| if n == 1 { "argument" } else { "arguments" };
        match self.maximum {
            Some(max) if max == self.minimum => {
                format!("{} {}", self.minimum, plural(self.minimum))
            }
            Some(max) => format!(
                "at least {} {} but no more than {} {}",
                self.minimum,
                plural(self.minimum),
                max,
                plural(max)
            ),
            None => format!("at least {} {}", self.minimum, plural(self.minimum)),
        }
    }
}

/// An immutable, assembled instruction sequence.
///
/// Comments and label names live in side tables keyed by instruction
/// offset, so listings stay informative without the interpreter ever
/// paying for them. Option parent/child maps cover every option mapped
/// anywhere in the program, including embedded option sub-programs.
#[derive(Debug)]
pub struct CharmProgram {
    pub id: u64,
    pub name: String,
    pub total: ArgTally,
    pub code: Vec<Instruction>,
    pub comments: FxHashMap<usize, Vec<String>>,
    pub labels: FxHashMap<usize, Vec<String>>,
    /// option → options mapped inside that option's sub-program.
    pub option_to_child_options: FxHashMap<OptionKey, FxHashSet<OptionKey>>,
    /// option → options whose sub-programs map it.
    pub option_to_parent_options: FxHashMap<OptionKey, FxHashSet<OptionKey>>,
}

impl CharmProgram {
    pub(crate) fn next_id() -> u64 {
        NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.code.get(index)
    }

    /// The mnemonic sequence, for bytecode tests.
    pub fn opcode_names(&self) -> Vec<&'static str> {
        self.code.iter().map(Instruction::name).collect()
    }

    /// Assert the program is exactly the given mnemonic sequence.
    #[track_caller]
    pub fn assert_opcodes(&self, expected: &[&str]) {
        let actual = self.opcode_names();
        assert_eq!(
            actual, expected,
            "bytecode mismatch.\nexpected: {expected:?}\nactual:   {actual:?}",
        );
    }

    /// Assert the given mnemonics appear in order (not necessarily
    /// contiguously).
    #[track_caller]
    pub fn assert_contains_opcodes(&self, expected: &[&str]) {
        let actual = self.opcode_names();
        let mut want = expected.iter().peekable();
        for name in &actual {
            if want.peek() == Some(&name) {
                want.next();
            }
        }
        let missing: Vec<_> = want.collect();
        assert!(
            missing.is_empty(),
            "missing opcodes in sequence.\nexpected to find: {missing:?}\nactual bytecode:  {actual:?}",
        );
    }

    /// A human-readable listing, interleaving the side tables.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("program {} {:?}\n", self.id, self.name));
        for (i, instruction) in self.code.iter().enumerate() {
            if let Some(labels) = self.labels.get(&i) {
                for label in labels {
                    out.push_str(&format!("     {label}:\n"));
                }
            }
            if let Some(comments) = self.comments.get(&i) {
                for comment in comments {
                    out.push_str(&format!("     ; {comment}\n"));
                }
            }
            out.push_str(&format!("{i:3}  {instruction:?}\n"));
        }
        out
    }
}

impl fmt::Display for CharmProgram {
    /// The header line only; use [`CharmProgram::listing`] for the full
    /// dump.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<program {} {:?} minimum={} maximum={:?}>",
            self.id, self.name, self.total.minimum, self.total.maximum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(code: Vec<Instruction>) -> CharmProgram {
        CharmProgram {
            id: CharmProgram::next_id(),
            name: "test".to_string(),
            total: ArgTally::default(),
            code,
            comments: FxHashMap::default(),
            labels: FxHashMap::default(),
            option_to_child_options: FxHashMap::default(),
            option_to_parent_options: FxHashMap::default(),
        }
    }

    #[test]
    fn tally_descriptions() {
        let fixed = ArgTally {
            minimum: 1,
            maximum: Some(1),
        };
        assert_eq!(fixed.describe(), "1 argument");

        let ranged = ArgTally {
            minimum: 1,
            maximum: Some(3),
        };
        assert_eq!(
            ranged.describe(),
            "at least 1 argument but no more than 3 arguments"
        );

        let unbounded = ArgTally {
            minimum: 2,
            maximum: None,
        };
        assert_eq!(unbounded.describe(), "at least 2 arguments");
    }

    #[test]
    fn opcode_assertions() {
        let p = program(vec![
            Instruction::NextToO {
                required: true,
                is_oparg: false,
            },
            Instruction::End,
        ]);
        p.assert_opcodes(&["next_to_o", "end"]);
        p.assert_contains_opcodes(&["end"]);
    }

    #[test]
    #[should_panic(expected = "bytecode mismatch")]
    fn opcode_assertion_failure() {
        let p = program(vec![Instruction::End]);
        p.assert_opcodes(&["jump"]);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(CharmProgram::next_id(), CharmProgram::next_id());
    }
}
