//! The Charm compiler: lowers an analyzed annotation tree into bytecode.
//!
//! Four compiler variants share one bytecode model:
//!
//! * [`compile_command`] — a command-line grammar for a root callable;
//! * option programs — compiled recursively by the command compiler and
//!   embedded in `map_option` instructions;
//! * [`compile_mapping`] — read arguments from a keyed structure;
//! * [`compile_iterator`] — read arguments from a flat row of values.
//!
//! Programs are immutable after assembly and shared via `Arc`; a single
//! program may be executed by any number of interpreter instances.

mod assembler;
mod compile;
mod instruction;
mod mapping;
mod program;

pub use assembler::Assembler;
pub use compile::{CompileTarget, compile_command};
pub use instruction::{ConverterKey, GroupId, GroupSpec, Instruction, LabelId};
pub use mapping::{compile_iterator, compile_mapping};
pub use program::{ArgTally, CharmProgram};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use appeal_core::{
        Annotation, CallableImpl, CallableRegistry, FactoryRegistry, OptionKey, ParamKind,
        ParamSpec, ScalarKind, Signature, Value,
    };

    use super::*;

    fn noop() -> CallableImpl {
        CallableImpl::Native(Arc::new(|_| Ok(Value::Null)))
    }

    #[test]
    fn two_required_strings() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder().positional("a").positional("b").build(),
            noop(),
        );
        let program =
            compile_command(&registry, &FactoryRegistry::with_defaults(), id).unwrap();
        program.assert_opcodes(&[
            "set_group",
            "create_converter",
            "next_to_o",
            "load_converter",
            "append_to_converter_args",
            "next_to_o",
            "append_to_converter_args",
            "end",
        ]);
        assert_eq!(program.total.minimum, 2);
        assert_eq!(program.total.maximum, Some(2));
    }

    #[test]
    fn optional_parameter_opens_a_group() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder()
                .positional("a")
                .positional_with("b", None, Some(Value::str("z")))
                .build(),
            noop(),
        );
        let program =
            compile_command(&registry, &FactoryRegistry::with_defaults(), id).unwrap();
        program.assert_contains_opcodes(&["set_group", "next_to_o", "set_group", "next_to_o"]);
        assert_eq!(program.total.minimum, 1);
        assert_eq!(program.total.maximum, Some(2));

        // the optional leaf ends the program when no token is present
        program.assert_contains_opcodes(&["next_to_o", "branch_on_flag", "end"]);
    }

    #[test]
    fn keyword_only_parameter_maps_options() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder()
                .keyword_only(
                    "count",
                    Annotation::Scalar(ScalarKind::Int),
                    Value::Int(0),
                )
                .build(),
            noop(),
        );
        let count_param = ParamSpec::new("count", ParamKind::KeywordOnly)
            .with_annotation(Annotation::Scalar(ScalarKind::Int))
            .with_default(Value::Int(0));
        registry
            .add_option(id, "count", OptionKey::Short('c'), count_param.clone())
            .unwrap();
        registry
            .add_option(id, "count", OptionKey::normalize("--count"), count_param)
            .unwrap();

        let program =
            compile_command(&registry, &FactoryRegistry::with_defaults(), id).unwrap();
        let map_options: Vec<_> = program
            .code
            .iter()
            .filter_map(|i| match i {
                Instruction::MapOption {
                    option, program, ..
                } => Some((option.clone(), program.clone())),
                _ => None,
            })
            .collect();
        // both aliases, sharing one sub-program
        assert_eq!(map_options.len(), 2);
        assert!(Arc::ptr_eq(&map_options[0].1, &map_options[1].1));
        // the oparg program consumes exactly one argument
        assert_eq!(map_options[0].1.total.minimum, 1);
        assert_eq!(map_options[0].1.total.maximum, Some(1));
    }

    #[test]
    fn flag_option_program_takes_no_arguments() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder()
                .keyword_only("verbose", None, Value::Bool(false))
                .build(),
            noop(),
        );
        let flag_param =
            ParamSpec::new("verbose", ParamKind::KeywordOnly).with_default(Value::Bool(false));
        registry
            .add_option(id, "verbose", OptionKey::Short('v'), flag_param)
            .unwrap();

        let program =
            compile_command(&registry, &FactoryRegistry::with_defaults(), id).unwrap();
        let sub = program
            .code
            .iter()
            .find_map(|i| match i {
                Instruction::MapOption { program, .. } => Some(program.clone()),
                _ => None,
            })
            .expect("flag option mapped");
        assert_eq!(sub.total.minimum, 0);
        assert_eq!(sub.total.maximum, Some(0));
        sub.assert_contains_opcodes(&["create_converter", "set_in_converter_kwargs", "end"]);
    }

    #[test]
    fn var_positional_compiles_to_a_loop() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder()
                .positional("a")
                .var_positional("rest", None)
                .build(),
            noop(),
        );
        let program =
            compile_command(&registry, &FactoryRegistry::with_defaults(), id).unwrap();
        program.assert_contains_opcodes(&[
            "remember_converters",
            "set_group",
            "next_to_o",
            "forget_converters",
            "jump",
        ]);
        assert_eq!(program.total.minimum, 1);
        assert_eq!(program.total.maximum, None);

        // the loop jumps back to before the set_group, so every iteration
        // re-enters the group with a fresh count
        let jump_address = program
            .code
            .iter()
            .rev()
            .find_map(|i| match i {
                Instruction::Jump { address } => Some(*address),
                _ => None,
            })
            .expect("loop jump");
        let set_group_at = program
            .code
            .iter()
            .position(|i| {
                matches!(i, Instruction::SetGroup { spec } if spec.repeating)
            })
            .expect("repeating set_group");
        assert!(jump_address < set_group_at);
    }

    #[test]
    fn nested_converter_creates_both_converters_in_its_group() {
        let mut registry = CallableRegistry::new();
        let pair = registry.register(
            "pair",
            Signature::builder().positional("x").positional("y").build(),
            noop(),
        );
        let id = registry.register(
            "cmd",
            Signature::builder()
                .positional("s")
                .positional_with("p", Annotation::Callable(pair), Some(Value::Null))
                .build(),
            noop(),
        );
        let program =
            compile_command(&registry, &FactoryRegistry::with_defaults(), id).unwrap();
        // the discretionary append for p, then mandatory wiring for x and y
        let appends: Vec<bool> = program
            .code
            .iter()
            .filter_map(|i| match i {
                Instruction::AppendToConverterArgs { discretionary, .. } => Some(*discretionary),
                _ => None,
            })
            .collect();
        assert_eq!(appends, vec![false, true, false, false]);
        assert_eq!(program.total.minimum, 1);
        assert_eq!(program.total.maximum, Some(3));
    }

    #[test]
    fn mapping_program_reads_by_key() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder()
                .positional("name")
                .positional_with("nickname", None, Some(Value::str("none")))
                .build(),
            noop(),
        );
        let program =
            compile_mapping(&registry, &FactoryRegistry::with_defaults(), id).unwrap();
        let lookups: Vec<(&str, bool)> = program
            .code
            .iter()
            .filter_map(|i| match i {
                Instruction::LookupToO { key, required } => Some((key.as_str(), *required)),
                _ => None,
            })
            .collect();
        assert_eq!(lookups, vec![("name", true), ("nickname", false)]);
        // the optional leaf falls back to its default when the key is
        // absent
        program.assert_contains_opcodes(&["lookup_to_o", "branch_on_flag", "literal_to_o"]);
    }

    #[test]
    fn iterator_program_reads_positionally() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder().positional("a").positional("b").build(),
            noop(),
        );
        let program =
            compile_iterator(&registry, &FactoryRegistry::with_defaults(), id).unwrap();
        assert!(
            !program
                .code
                .iter()
                .any(|i| matches!(i, Instruction::LookupToO { .. }))
        );
        let next_count = program
            .code
            .iter()
            .filter(|i| matches!(i, Instruction::NextToO { .. }))
            .count();
        assert_eq!(next_count, 2);
    }
}
