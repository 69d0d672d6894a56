//! The Charm assembler.
//!
//! An assembler is a tree: a sequence of instruction runs and *nested
//! assemblers*. Compilers rely on that heavily — they emit out-of-order
//! sections (group initialization, option mappings, bodies) into separate
//! assemblers, append them where they belong, and keep writing to each.
//! Assembly flattens the tree depth-first, then:
//!
//! * moves comments and label names into side tables,
//! * resolves label-relative jumps to absolute offsets,
//! * collapses jump-to-jump chains,
//! * removes `LoadConverter`/`LoadO`/`ConverterToO` instructions made
//!   redundant by straight-line dataflow (tracking resets at every jump
//!   target),
//! * and computes the per-group and aggregate min/max argument counts
//!   from `SetGroup`/`NextToO`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use appeal_core::{ConfigError, OptionKey, ParamSpec, Value};

use crate::instruction::{ConverterKey, GroupId, GroupSpec, Instruction, LabelId};
use crate::program::{ArgTally, CharmProgram};

enum Block {
    Ops(Vec<Instruction>),
    Nested(Assembler),
}

struct AsmInner {
    name: String,
    blocks: Vec<Block>,
    option_to_child_options: FxHashMap<OptionKey, FxHashSet<OptionKey>>,
    option_to_parent_options: FxHashMap<OptionKey, FxHashSet<OptionKey>>,
    repeating_groups: FxHashSet<GroupId>,
}

/// A shared handle on one assembler node. Cloning shares the node, which
/// is what lets a compiler keep appending to a section after nesting it
/// somewhere.
#[derive(Clone)]
pub struct Assembler {
    inner: Rc<RefCell<AsmInner>>,
}

impl Assembler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(AsmInner {
                name: name.into(),
                blocks: Vec::new(),
                option_to_child_options: FxHashMap::default(),
                option_to_parent_options: FxHashMap::default(),
                repeating_groups: FxHashSet::default(),
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    fn push(&self, instruction: Instruction) {
        let mut inner = self.inner.borrow_mut();
        match inner.blocks.last_mut() {
            Some(Block::Ops(ops)) => ops.push(instruction),
            _ => inner.blocks.push(Block::Ops(vec![instruction])),
        }
    }

    /// Nest another assembler at the current position. The child remains
    /// writable through its own handle.
    pub fn append_assembler(&self, child: &Assembler) {
        self.inner.borrow_mut().blocks.push(Block::Nested(child.clone()));
    }

    /// Total instruction count, nested assemblers included.
    pub fn len(&self) -> usize {
        let inner = self.inner.borrow();
        inner
            .blocks
            .iter()
            .map(|b| match b {
                Block::Ops(ops) => ops.len(),
                Block::Nested(child) => child.len(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything appended so far.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.blocks.clear();
        inner.option_to_child_options.clear();
        inner.option_to_parent_options.clear();
        inner.repeating_groups.clear();
    }

    /// Clear sections whose only content is a comment or label, so the
    /// assembled program doesn't carry stray section headers.
    pub fn clear_if_inert(&self) {
        if self.len() != 1 {
            return;
        }
        let inert = {
            let inner = self.inner.borrow();
            fn first(blocks: &[Block]) -> Option<Instruction> {
                for block in blocks {
                    match block {
                        Block::Ops(ops) => {
                            if let Some(op) = ops.first() {
                                return Some(op.clone());
                            }
                        }
                        Block::Nested(child) => {
                            if let Some(op) = first(&child.inner.borrow().blocks) {
                                return Some(op);
                            }
                        }
                    }
                }
                None
            }
            matches!(
                first(&inner.blocks),
                Some(Instruction::Comment { .. }) | Some(Instruction::Label { .. })
            )
        };
        if inert {
            self.clear();
        }
    }

    /// Record that a group loops; applied to its `SetGroup` at assembly.
    pub fn mark_repeating(&self, group: GroupId) {
        self.inner.borrow_mut().repeating_groups.insert(group);
    }

    // ======================================================================
    // Emitters, one per instruction
    // ======================================================================

    pub fn end(&self) {
        self.push(Instruction::End);
    }

    pub fn abort(&self, message: impl Into<String>) {
        self.push(Instruction::Abort {
            message: message.into(),
        });
    }

    pub fn no_op(&self) {
        self.push(Instruction::NoOp);
    }

    pub fn comment(&self, text: impl Into<String>) {
        self.push(Instruction::Comment { text: text.into() });
    }

    pub fn label(&self, label: LabelId, name: impl Into<String>) {
        self.push(Instruction::Label {
            label,
            name: name.into(),
        });
    }

    pub fn jump_to_label(&self, label: LabelId) {
        self.push(Instruction::JumpToLabel { label });
    }

    pub fn branch_on_flag_to_label(&self, label: LabelId) {
        self.push(Instruction::BranchOnFlagToLabel { label });
    }

    pub fn branch_on_not_flag_to_label(&self, label: LabelId) {
        self.push(Instruction::BranchOnNotFlagToLabel { label });
    }

    pub fn label_to_o(&self, label: LabelId) {
        self.push(Instruction::LabelToO { label });
    }

    pub fn indirect_jump(&self) {
        self.push(Instruction::IndirectJump);
    }

    pub fn literal_to_o(&self, value: Value) {
        self.push(Instruction::LiteralToO { value });
    }

    pub fn wrap_o_with_iterator(&self) {
        self.push(Instruction::WrapOWithIterator);
    }

    pub fn create_converter(&self, param: ParamSpec, key: ConverterKey) {
        self.push(Instruction::CreateConverter { param, key });
    }

    pub fn load_converter(&self, key: ConverterKey) {
        self.push(Instruction::LoadConverter { key });
    }

    pub fn load_o(&self, key: ConverterKey) {
        self.push(Instruction::LoadO { key });
    }

    pub fn converter_to_o(&self) {
        self.push(Instruction::ConverterToO);
    }

    pub fn append_to_converter_args(
        &self,
        param: impl Into<String>,
        usage: Option<String>,
        discretionary: bool,
    ) {
        self.push(Instruction::AppendToConverterArgs {
            param: param.into(),
            usage,
            discretionary,
        });
    }

    pub fn set_in_converter_kwargs(&self, param: impl Into<String>, usage: Option<String>) {
        self.push(Instruction::SetInConverterKwargs {
            param: param.into(),
            usage,
        });
    }

    pub fn push_o(&self) {
        self.push(Instruction::PushO);
    }

    pub fn pop_o(&self) {
        self.push(Instruction::PopO);
    }

    pub fn peek_o(&self) {
        self.push(Instruction::PeekO);
    }

    pub fn push_flag(&self) {
        self.push(Instruction::PushFlag);
    }

    pub fn pop_flag(&self) {
        self.push(Instruction::PopFlag);
    }

    pub fn push_mapping(&self) {
        self.push(Instruction::PushMapping);
    }

    pub fn pop_mapping(&self) {
        self.push(Instruction::PopMapping);
    }

    pub fn push_iterator(&self) {
        self.push(Instruction::PushIterator);
    }

    pub fn pushback_o_to_iterator(&self) {
        self.push(Instruction::PushbackOToIterator);
    }

    pub fn pop_iterator(&self) {
        self.push(Instruction::PopIterator);
    }

    pub fn test_is_o_true(&self) {
        self.push(Instruction::TestIsOTrue);
    }

    pub fn test_is_o_none(&self) {
        self.push(Instruction::TestIsONone);
    }

    pub fn test_is_o_empty(&self) {
        self.push(Instruction::TestIsOEmpty);
    }

    pub fn test_is_o_iterable(&self) {
        self.push(Instruction::TestIsOIterable);
    }

    pub fn test_is_o_mapping(&self) {
        self.push(Instruction::TestIsOMapping);
    }

    pub fn test_is_o_str_or_bytes(&self) {
        self.push(Instruction::TestIsOStrOrBytes);
    }

    /// Map an option onto its sub-program, and fold the sub-program's
    /// option relationships into this assembler's tables.
    pub fn map_option(
        &self,
        group: GroupId,
        option: OptionKey,
        program: Arc<CharmProgram>,
        key: ConverterKey,
        param: impl Into<String>,
    ) {
        {
            let mut inner = self.inner.borrow_mut();
            let children = inner
                .option_to_child_options
                .entry(option.clone())
                .or_default();
            for child in program.option_to_child_options.keys() {
                children.insert(child.clone());
            }
            for (k, parents) in &program.option_to_parent_options {
                inner
                    .option_to_parent_options
                    .entry(k.clone())
                    .or_default()
                    .extend(parents.iter().cloned());
            }
            for child in program.option_to_child_options.keys() {
                inner
                    .option_to_parent_options
                    .entry(child.clone())
                    .or_default()
                    .insert(option.clone());
            }
        }
        self.push(Instruction::MapOption {
            group,
            option,
            program,
            key,
            param: param.into(),
        });
    }

    pub fn next_to_o(&self, required: bool, is_oparg: bool) {
        self.push(Instruction::NextToO { required, is_oparg });
    }

    pub fn lookup_to_o(&self, key: impl Into<String>, required: bool) {
        self.push(Instruction::LookupToO {
            key: key.into(),
            required,
        });
    }

    pub fn flush_multioption(&self) {
        self.push(Instruction::FlushMultioption);
    }

    pub fn remember_converters(&self) {
        self.push(Instruction::RememberConverters);
    }

    pub fn forget_converters(&self) {
        self.push(Instruction::ForgetConverters);
    }

    pub fn set_group(&self, id: GroupId, optional: bool) {
        self.push(Instruction::SetGroup {
            spec: GroupSpec::new(id, optional),
        });
    }

    // ======================================================================
    // Assembly
    // ======================================================================

    fn flatten_into(
        &self,
        code: &mut Vec<Instruction>,
        child_options: &mut FxHashMap<OptionKey, FxHashSet<OptionKey>>,
        parent_options: &mut FxHashMap<OptionKey, FxHashSet<OptionKey>>,
        repeating: &mut FxHashSet<GroupId>,
    ) {
        let inner = self.inner.borrow();
        for (option, children) in &inner.option_to_child_options {
            child_options
                .entry(option.clone())
                .or_default()
                .extend(children.iter().cloned());
        }
        for (option, parents) in &inner.option_to_parent_options {
            parent_options
                .entry(option.clone())
                .or_default()
                .extend(parents.iter().cloned());
        }
        repeating.extend(inner.repeating_groups.iter().copied());

        for block in &inner.blocks {
            match block {
                Block::Ops(ops) => code.extend(ops.iter().cloned()),
                Block::Nested(child) => {
                    child.flatten_into(code, child_options, parent_options, repeating)
                }
            }
        }
    }

    /// Flatten and assemble into an immutable [`CharmProgram`].
    pub fn assemble(&self) -> Result<CharmProgram, ConfigError> {
        let mut code = Vec::new();
        let mut child_options = FxHashMap::default();
        let mut parent_options = FxHashMap::default();
        let mut repeating = FxHashSet::default();
        self.flatten_into(&mut code, &mut child_options, &mut parent_options, &mut repeating);

        if !matches!(code.last(), Some(Instruction::End)) {
            code.push(Instruction::End);
        }

        // Strip comments, labels, and no-ops; remember where labels and
        // fixup sites land.
        let mut labels: FxHashMap<LabelId, usize> = FxHashMap::default();
        let mut external_comments: Vec<(usize, String)> = Vec::new();
        let mut external_labels: Vec<(usize, String)> = Vec::new();
        let mut fixups: Vec<usize> = Vec::new();

        let mut index = 0;
        while index < code.len() {
            match &code[index] {
                Instruction::Comment { text } => {
                    external_comments.push((index, text.clone()));
                    code.remove(index);
                }
                Instruction::Label { label, name } => {
                    if labels.contains_key(label) {
                        return Err(ConfigError::DuplicateLabel { label: name.clone() });
                    }
                    labels.insert(*label, index);
                    external_labels.push((index, name.clone()));
                    code.remove(index);
                }
                Instruction::NoOp => {
                    code.remove(index);
                }
                Instruction::JumpToLabel { .. }
                | Instruction::BranchOnFlagToLabel { .. }
                | Instruction::BranchOnNotFlagToLabel { .. }
                | Instruction::LabelToO { .. } => {
                    fixups.push(index);
                    index += 1;
                }
                _ => index += 1,
            }
        }

        // Resolve label-relative pseudo-ops to absolute addresses.
        for &i in &fixups {
            let resolve = |label: &LabelId| {
                labels
                    .get(label)
                    .copied()
                    .ok_or(ConfigError::UnknownLabel {
                        label: format!("label-{}", label.0),
                    })
            };
            code[i] = match &code[i] {
                Instruction::JumpToLabel { label } => Instruction::Jump {
                    address: resolve(label)?,
                },
                Instruction::BranchOnFlagToLabel { label } => Instruction::BranchOnFlag {
                    address: resolve(label)?,
                },
                Instruction::BranchOnNotFlagToLabel { label } => Instruction::BranchOnNotFlag {
                    address: resolve(label)?,
                },
                Instruction::LabelToO { label } => Instruction::AddressToO {
                    address: resolve(label)?,
                },
                _ => unreachable!("fixup index does not hold a label-relative instruction"),
            };
        }

        // Collapse jump-to-jump chains, collecting the surviving targets.
        let mut jump_targets: FxHashSet<usize> = FxHashSet::default();
        for &i in &fixups {
            loop {
                let address = instruction_address(&code[i]);
                match &code[address] {
                    Instruction::Jump { address: next } => {
                        let next = *next;
                        set_instruction_address(&mut code[i], next);
                        if next == address {
                            // self-referential jump; leave it alone
                            jump_targets.insert(next);
                            break;
                        }
                    }
                    _ => {
                        jump_targets.insert(address);
                        break;
                    }
                }
            }
        }

        // One forward pass: mark redundant register loads for deletion and
        // tally group / total argument counts. Register knowledge resets
        // at every jump target.
        #[derive(Clone, Copy, PartialEq)]
        enum Track {
            Unknown,
            Key(ConverterKey),
            Str,
        }

        let mut converter = Track::Unknown;
        let mut o = Track::Unknown;
        let mut total = ArgTally {
            minimum: 0,
            maximum: Some(0),
        };
        let mut optional = false;
        let mut current_group: Option<usize> = None;
        let mut delete = vec![false; code.len()];

        for index in 0..code.len() {
            if jump_targets.contains(&index) {
                converter = Track::Unknown;
                o = Track::Unknown;
            }
            match &code[index] {
                Instruction::SetGroup { spec } => {
                    let is_repeating = spec.repeating || repeating.contains(&spec.id);
                    optional = spec.optional;
                    if is_repeating {
                        total.maximum = None;
                    }
                    current_group = Some(index);
                    if is_repeating {
                        if let Instruction::SetGroup { spec } = &mut code[index] {
                            spec.repeating = true;
                        }
                    }
                }
                Instruction::NextToO { .. } => {
                    if !optional {
                        total.minimum += 1;
                    }
                    if let Some(max) = &mut total.maximum {
                        *max += 1;
                    }
                    if let Some(group_index) = current_group {
                        if let Instruction::SetGroup { spec } = &mut code[group_index] {
                            spec.minimum += 1;
                            spec.maximum += 1;
                        }
                    }
                    o = Track::Str;
                }
                Instruction::LookupToO { .. } => {
                    o = Track::Unknown;
                }
                Instruction::LiteralToO { .. }
                | Instruction::AddressToO { .. }
                | Instruction::WrapOWithIterator
                | Instruction::PopO
                | Instruction::PeekO => {
                    o = Track::Unknown;
                }
                Instruction::LoadConverter { key } => {
                    if converter == Track::Key(*key) {
                        delete[index] = true;
                    } else {
                        converter = Track::Key(*key);
                    }
                }
                Instruction::LoadO { key } => {
                    if o == Track::Key(*key) {
                        delete[index] = true;
                    } else {
                        o = Track::Key(*key);
                    }
                }
                Instruction::ConverterToO => {
                    if o == converter {
                        delete[index] = true;
                    } else {
                        o = converter;
                    }
                }
                Instruction::CreateConverter { key, .. } => {
                    o = Track::Key(*key);
                }
                Instruction::End => {
                    // a frame boundary: whatever follows runs with
                    // restored registers
                    converter = Track::Unknown;
                    o = Track::Unknown;
                }
                _ => {}
            }
        }

        // Sweep, remapping addresses and side-table offsets.
        let mut new_index = vec![0usize; code.len() + 1];
        let mut kept = 0;
        for (i, &dead) in delete.iter().enumerate() {
            new_index[i] = kept;
            if !dead {
                kept += 1;
            }
        }
        new_index[code.len()] = kept;

        let mut final_code = Vec::with_capacity(kept);
        for (i, instruction) in code.into_iter().enumerate() {
            if delete[i] {
                continue;
            }
            let mut instruction = instruction;
            if has_address(&instruction) {
                let address = instruction_address(&instruction);
                set_instruction_address(&mut instruction, new_index[address]);
            }
            final_code.push(instruction);
        }

        let mut comments: FxHashMap<usize, Vec<String>> = FxHashMap::default();
        for (i, text) in external_comments {
            comments.entry(new_index[i]).or_default().push(text);
        }
        let mut label_table: FxHashMap<usize, Vec<String>> = FxHashMap::default();
        for (i, name) in external_labels {
            label_table.entry(new_index[i]).or_default().push(name);
        }

        Ok(CharmProgram {
            id: CharmProgram::next_id(),
            name: self.name(),
            total,
            code: final_code,
            comments,
            labels: label_table,
            option_to_child_options: child_options,
            option_to_parent_options: parent_options,
        })
    }
}

fn has_address(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::Jump { .. }
            | Instruction::BranchOnFlag { .. }
            | Instruction::BranchOnNotFlag { .. }
            | Instruction::AddressToO { .. }
    )
}

fn instruction_address(instruction: &Instruction) -> usize {
    match instruction {
        Instruction::Jump { address }
        | Instruction::BranchOnFlag { address }
        | Instruction::BranchOnNotFlag { address }
        | Instruction::AddressToO { address } => *address,
        _ => unreachable!("instruction has no address operand"),
    }
}

fn set_instruction_address(instruction: &mut Instruction, new_address: usize) {
    match instruction {
        Instruction::Jump { address }
        | Instruction::BranchOnFlag { address }
        | Instruction::BranchOnNotFlag { address }
        | Instruction::AddressToO { address } => *address = new_address,
        _ => unreachable!("instruction has no address operand"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_end_if_missing() {
        let a = Assembler::new("t");
        a.next_to_o(true, false);
        let program = a.assemble().unwrap();
        program.assert_opcodes(&["next_to_o", "end"]);
    }

    #[test]
    fn nested_assemblers_flatten_in_order() {
        let root = Assembler::new("root");
        let first = Assembler::new("first");
        let second = Assembler::new("second");
        root.append_assembler(&first);
        root.append_assembler(&second);
        // write out of order; position is fixed by the append
        second.pop_o();
        first.push_o();
        let program = root.assemble().unwrap();
        program.assert_opcodes(&["push_o", "pop_o", "end"]);
    }

    #[test]
    fn labels_resolve_and_are_externalized() {
        let a = Assembler::new("t");
        let done = LabelId(0);
        a.test_is_o_true();
        a.branch_on_flag_to_label(done);
        a.abort("nope");
        a.label(done, "done");
        a.end();
        let program = a.assemble().unwrap();
        program.assert_opcodes(&["test_is_o_true", "branch_on_flag", "abort", "end"]);
        match &program.code[1] {
            Instruction::BranchOnFlag { address } => assert_eq!(*address, 3),
            other => panic!("expected branch, got {other:?}"),
        }
        assert_eq!(program.labels[&3], vec!["done".to_string()]);
    }

    #[test]
    fn duplicate_label_is_config_error() {
        let a = Assembler::new("t");
        a.label(LabelId(0), "x");
        a.push_o();
        a.label(LabelId(0), "x again");
        assert!(matches!(
            a.assemble(),
            Err(ConfigError::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn unknown_label_is_config_error() {
        let a = Assembler::new("t");
        a.jump_to_label(LabelId(7));
        assert!(matches!(a.assemble(), Err(ConfigError::UnknownLabel { .. })));
    }

    #[test]
    fn jump_to_jump_collapses() {
        let a = Assembler::new("t");
        let l1 = LabelId(0);
        let l2 = LabelId(1);
        a.jump_to_label(l1);
        a.label(l1, "hop");
        a.jump_to_label(l2);
        a.label(l2, "final");
        a.push_o();
        let program = a.assemble().unwrap();
        // first jump goes straight to the final target
        match &program.code[0] {
            Instruction::Jump { address } => {
                assert!(matches!(program.code[*address], Instruction::PushO))
            }
            other => panic!("expected jump, got {other:?}"),
        }
    }

    #[test]
    fn redundant_loads_are_removed() {
        let key = ConverterKey(1);
        let a = Assembler::new("t");
        a.load_converter(key);
        a.load_converter(key);
        a.load_o(key);
        a.load_o(key);
        let program = a.assemble().unwrap();
        program.assert_opcodes(&["load_converter", "load_o", "end"]);
    }

    #[test]
    fn loads_survive_at_jump_targets() {
        let key = ConverterKey(1);
        let a = Assembler::new("t");
        let top = LabelId(0);
        a.load_converter(key);
        a.label(top, "top");
        a.load_converter(key);
        a.test_is_o_true();
        a.branch_on_flag_to_label(top);
        let program = a.assemble().unwrap();
        // the second load is a jump target, so dataflow knowledge resets
        // and it must survive
        program.assert_opcodes(&[
            "load_converter",
            "load_converter",
            "test_is_o_true",
            "branch_on_flag",
            "end",
        ]);
    }

    #[test]
    fn totals_and_group_counts() {
        let a = Assembler::new("t");
        a.set_group(GroupId(1), false);
        a.next_to_o(true, false);
        a.next_to_o(true, false);
        a.set_group(GroupId(2), true);
        a.next_to_o(false, false);
        let program = a.assemble().unwrap();
        assert_eq!(program.total.minimum, 2);
        assert_eq!(program.total.maximum, Some(3));
        let specs: Vec<_> = program
            .code
            .iter()
            .filter_map(|i| match i {
                Instruction::SetGroup { spec } => Some(spec.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(specs[0].minimum, 2);
        assert_eq!(specs[0].maximum, 2);
        assert_eq!(specs[1].minimum, 1);
        assert_eq!(specs[1].maximum, 1);
    }

    #[test]
    fn repeating_group_unbounds_total() {
        let a = Assembler::new("t");
        a.set_group(GroupId(1), true);
        a.mark_repeating(GroupId(1));
        a.next_to_o(false, false);
        let program = a.assemble().unwrap();
        assert_eq!(program.total.maximum, None);
        match &program.code[0] {
            Instruction::SetGroup { spec } => assert!(spec.repeating),
            other => panic!("expected set_group, got {other:?}"),
        }
    }

    #[test]
    fn comments_move_to_side_table() {
        let a = Assembler::new("t");
        a.comment("group 1 body");
        a.push_o();
        let program = a.assemble().unwrap();
        program.assert_opcodes(&["push_o", "end"]);
        assert_eq!(program.comments[&0], vec!["group 1 body".to_string()]);
    }
}
