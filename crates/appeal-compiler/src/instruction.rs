//! The Charm instruction set.
//!
//! Instructions are tagged-union values, not packed bytes: operands ride
//! along inside the variant. The tail of the enum holds the
//! assembler-only pseudo-instructions (labels, label-relative jumps,
//! comments, no-ops); assembly resolves or strips all of them, so the
//! interpreter never sees one.

use std::sync::Arc;

use appeal_core::{OptionKey, ParamSpec, Value};

use crate::program::CharmProgram;

/// A label allocated by a compiler; resolved to an absolute offset at
/// assembly time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// Identifies one argument group within a compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ag-{}", self.0)
    }
}

/// Identifies one converter slot within a parse. Keys are unique across a
/// command program *and* every option sub-program embedded in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConverterKey(pub u32);

impl std::fmt::Display for ConverterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "k-{}", self.0)
    }
}

/// Static description of an argument group, embedded in `SetGroup`.
///
/// `minimum`/`maximum` are filled in by the assembly pass, which counts
/// the `NextToO` instructions executed under each group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub id: GroupId,
    pub optional: bool,
    pub repeating: bool,
    pub minimum: usize,
    pub maximum: usize,
}

impl GroupSpec {
    pub fn new(id: GroupId, optional: bool) -> Self {
        Self {
            id,
            optional,
            repeating: false,
            minimum: 0,
            maximum: 0,
        }
    }
}

/// One Charm instruction.
#[derive(Debug, Clone)]
pub enum Instruction {
    // control
    /// Pop a call-stack frame; terminate when the stack is empty.
    End,
    /// Raise a usage error with a fixed message.
    Abort { message: String },
    /// Unconditional jump to an absolute offset.
    Jump { address: usize },
    /// Jump to the address held in `o`.
    IndirectJump,
    /// Jump when `flag` is set.
    BranchOnFlag { address: usize },
    /// Jump when `flag` is clear.
    BranchOnNotFlag { address: usize },

    // register loads
    /// Store a literal value in `o`.
    LiteralToO { value: Value },
    /// Store an absolute offset in `o`, for `IndirectJump`.
    AddressToO { address: usize },
    /// Replace `o` with a one-element iterator yielding the old `o`.
    WrapOWithIterator,
    /// Load `converters[key]` into the `converter` register; `flag`
    /// records whether the key existed.
    LoadConverter { key: ConverterKey },
    /// Load `converters[key]` into `o`; `flag` records whether the key
    /// existed.
    LoadO { key: ConverterKey },
    /// Copy `converter` into `o`.
    ConverterToO,

    // tests
    TestIsOTrue,
    TestIsONone,
    TestIsOEmpty,
    TestIsOIterable,
    TestIsOMapping,
    TestIsOStrOrBytes,

    // data stack
    PushO,
    PopO,
    PeekO,
    PushFlag,
    PopFlag,

    // iterator / mapping stacks
    PushIterator,
    PopIterator,
    PushbackOToIterator,
    PushMapping,
    PopMapping,

    // converter ops
    /// Instantiate the converter for `param` and store it in
    /// `converters[key]` and `o`.
    CreateConverter { param: ParamSpec, key: ConverterKey },
    /// Append `o` to the `converter` register's positional buffer; when
    /// `discretionary`, queue it instead.
    AppendToConverterArgs {
        param: String,
        usage: Option<String>,
        discretionary: bool,
    },
    /// Store `o` in the `converter` register's keyword buffer.
    SetInConverterKwargs { param: String, usage: Option<String> },
    /// Fold the multi-option in `o`: bank the current invocation buffers.
    FlushMultioption,
    /// Open a tracking scope for converter keys.
    RememberConverters,
    /// Drop every key created since the matching `RememberConverters`.
    ForgetConverters,

    // grammar ops
    /// Enter an argument group.
    SetGroup { spec: GroupSpec },
    /// Map an option onto its sub-program for the current option scope.
    MapOption {
        group: GroupId,
        option: OptionKey,
        program: Arc<CharmProgram>,
        key: ConverterKey,
        param: String,
    },
    /// Consume the next token into `o`; pauses bytecode execution until
    /// the token loop produces one.
    NextToO { required: bool, is_oparg: bool },
    /// Look up `key` in the current mapping, into `o`.
    LookupToO { key: String, required: bool },

    // assembler-only pseudo-instructions; removed during assembly
    NoOp,
    Comment { text: String },
    Label { label: LabelId, name: String },
    JumpToLabel { label: LabelId },
    BranchOnFlagToLabel { label: LabelId },
    BranchOnNotFlagToLabel { label: LabelId },
    /// Resolves to `AddressToO` at the label's offset.
    LabelToO { label: LabelId },
}

impl Instruction {
    /// The instruction's mnemonic, used in listings and bytecode tests.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::End => "end",
            Instruction::Abort { .. } => "abort",
            Instruction::Jump { .. } => "jump",
            Instruction::IndirectJump => "indirect_jump",
            Instruction::BranchOnFlag { .. } => "branch_on_flag",
            Instruction::BranchOnNotFlag { .. } => "branch_on_not_flag",
            Instruction::LiteralToO { .. } => "literal_to_o",
            Instruction::AddressToO { .. } => "address_to_o",
            Instruction::WrapOWithIterator => "wrap_o_with_iterator",
            Instruction::LoadConverter { .. } => "load_converter",
            Instruction::LoadO { .. } => "load_o",
            Instruction::ConverterToO => "converter_to_o",
            Instruction::TestIsOTrue => "test_is_o_true",
            Instruction::TestIsONone => "test_is_o_none",
            Instruction::TestIsOEmpty => "test_is_o_empty",
            Instruction::TestIsOIterable => "test_is_o_iterable",
            Instruction::TestIsOMapping => "test_is_o_mapping",
            Instruction::TestIsOStrOrBytes => "test_is_o_str_or_bytes",
            Instruction::PushO => "push_o",
            Instruction::PopO => "pop_o",
            Instruction::PeekO => "peek_o",
            Instruction::PushFlag => "push_flag",
            Instruction::PopFlag => "pop_flag",
            Instruction::PushIterator => "push_iterator",
            Instruction::PopIterator => "pop_iterator",
            Instruction::PushbackOToIterator => "pushback_o_to_iterator",
            Instruction::PushMapping => "push_mapping",
            Instruction::PopMapping => "pop_mapping",
            Instruction::CreateConverter { .. } => "create_converter",
            Instruction::AppendToConverterArgs { .. } => "append_to_converter_args",
            Instruction::SetInConverterKwargs { .. } => "set_in_converter_kwargs",
            Instruction::FlushMultioption => "flush_multioption",
            Instruction::RememberConverters => "remember_converters",
            Instruction::ForgetConverters => "forget_converters",
            Instruction::SetGroup { .. } => "set_group",
            Instruction::MapOption { .. } => "map_option",
            Instruction::NextToO { .. } => "next_to_o",
            Instruction::LookupToO { .. } => "lookup_to_o",
            Instruction::NoOp => "no_op",
            Instruction::Comment { .. } => "comment",
            Instruction::Label { .. } => "label",
            Instruction::JumpToLabel { .. } => "jump_to_label",
            Instruction::BranchOnFlagToLabel { .. } => "branch_on_flag_to_label",
            Instruction::BranchOnNotFlagToLabel { .. } => "branch_on_not_flag_to_label",
            Instruction::LabelToO { .. } => "label_to_o",
        }
    }

    /// Is this one of the pseudo-instructions assembly must remove?
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            Instruction::NoOp
                | Instruction::Comment { .. }
                | Instruction::Label { .. }
                | Instruction::JumpToLabel { .. }
                | Instruction::BranchOnFlagToLabel { .. }
                | Instruction::BranchOnNotFlagToLabel { .. }
                | Instruction::LabelToO { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(Instruction::End.name(), "end");
        assert_eq!(
            Instruction::NextToO {
                required: true,
                is_oparg: false
            }
            .name(),
            "next_to_o"
        );
        assert_eq!(Instruction::JumpToLabel { label: LabelId(0) }.name(), "jump_to_label");
    }

    #[test]
    fn pseudo_detection() {
        assert!(Instruction::NoOp.is_pseudo());
        assert!(
            Instruction::Label {
                label: LabelId(1),
                name: "x".to_string()
            }
            .is_pseudo()
        );
        assert!(!Instruction::End.is_pseudo());
        assert!(!Instruction::Jump { address: 0 }.is_pseudo());
    }
}
