//! The mapping and iterator compilers.
//!
//! These compile a callable into a program that reads from a keyed
//! structure (`LookupToO` against the `mapping` register) or from a flat
//! row of values (`NextToO` against the iterator), instead of from a
//! command line. Nested converters probe whether the looked-up value is
//! itself a mapping and descend into it; callables registered as
//! "unnested" read their fields from the enclosing mapping instead.
//! Multi-option converters iterate the looked-up value, folding once per
//! element.
//!
//! Neither variant emits `set_group`: keyed reads have no positional
//! grammar to group.

use std::cell::Cell;
use std::sync::Arc;

use appeal_core::{
    Annotation, AppealError, CallableId, CallableRegistry, ConfigError, ConverterClass,
    FactoryRegistry, ParamKind, ParamSpec, ScalarKind, converter_signature,
};

use crate::assembler::Assembler;
use crate::instruction::{ConverterKey, LabelId};
use crate::program::CharmProgram;

/// Compile a program that reads the callable's arguments from a mapping.
pub fn compile_mapping(
    registry: &CallableRegistry,
    factories: &FactoryRegistry,
    callable: CallableId,
) -> Result<Arc<CharmProgram>, AppealError> {
    compile(registry, factories, callable, true)
}

/// Compile a program that reads the callable's arguments from a flat row
/// of values.
pub fn compile_iterator(
    registry: &CallableRegistry,
    factories: &FactoryRegistry,
    callable: CallableId,
) -> Result<Arc<CharmProgram>, AppealError> {
    compile(registry, factories, callable, false)
}

fn compile(
    registry: &CallableRegistry,
    factories: &FactoryRegistry,
    callable: CallableId,
    by_name: bool,
) -> Result<Arc<CharmProgram>, AppealError> {
    let entry = registry.get(callable)?;
    let spec = ParamSpec::new(entry.name.clone(), ParamKind::PositionalOnly)
        .with_annotation(Annotation::Callable(callable));
    let mut compiler = MappingCompiler {
        registry,
        factories,
        root_a: Assembler::new(entry.name.clone()),
        next_key: Cell::new(0),
        next_label: Cell::new(0),
    };
    // the root always reads from the outermost mapping (or row); there is
    // no enclosing value to descend into
    compiler.compile_parameter(&spec, by_name, None, 0, true)?;
    compiler.root_a.end();
    let program = compiler.root_a.assemble()?;
    log::debug!("compiled {} reader {:?}", if by_name { "mapping" } else { "row" }, program.name);
    Ok(Arc::new(program))
}

struct MappingCompiler<'r> {
    registry: &'r CallableRegistry,
    factories: &'r FactoryRegistry,
    root_a: Assembler,
    next_key: Cell<u32>,
    next_label: Cell<u32>,
}

impl<'r> MappingCompiler<'r> {
    fn next_converter_key(&self) -> ConverterKey {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        ConverterKey(key)
    }

    fn label(&self, name: impl Into<String>) -> (LabelId, String) {
        let id = self.next_label.get();
        self.next_label.set(id + 1);
        (LabelId(id), name.into())
    }

    /// Fetch one value into `o`: keyed lookup or the next row element.
    fn get_argument_to_o(&self, a: &Assembler, name: &str, required: bool, by_name: bool) {
        if by_name {
            a.lookup_to_o(name, required);
        } else {
            a.next_to_o(required, true);
        }
    }

    /// Compile one converter. Returns its key and whether the subtree is
    /// degenerate (a single-parameter chain read through one flat key).
    fn compile_parameter(
        &mut self,
        parameter: &ParamSpec,
        by_name: bool,
        degenerate_name: Option<&str>,
        depth: usize,
        force_unnested: bool,
    ) -> Result<(ConverterKey, bool), AppealError> {
        let class = self
            .factories
            .converter_for(parameter, self.registry, &parameter.name)?;
        let callable_name = match &class {
            ConverterClass::Single(id) | ConverterClass::Multi(id) => {
                self.registry.get(*id)?.name.clone()
            }
            ConverterClass::Simple(kind) => kind.type_name().to_string(),
            _ => parameter.name.clone(),
        };
        let signature = converter_signature(&class, self.registry)?;
        if signature.is_empty() {
            return Err(ConfigError::other(format!(
                "{callable_name}: can't process a converter that takes no parameters here"
            ))
            .into());
        }

        let converter_key = self.next_converter_key();
        let a = self.root_a.clone();

        let only_one_parameter = signature.len() == 1;
        let mut is_degenerate = depth > 0 && only_one_parameter;
        let multioption = class.is_multi();
        let unnested_requested = match class {
            ConverterClass::Single(id) | ConverterClass::Multi(id) => {
                self.registry.get(id)?.unnested
            }
            _ => false,
        };
        let nested = !(force_unnested || unnested_requested || multioption);
        let required = parameter.default.is_none();

        let degenerate_name = if is_degenerate { degenerate_name } else { None };

        // reads within a multioption always come from the iterator it
        // pushes over the looked-up value
        let mut by_name = by_name;

        let multi_labels = if multioption {
            by_name = false;
            let next = self.label(format!("{callable_name}: multioption, next"));
            let done = self.label(format!("{callable_name}: multioption, done"));
            let flush = self.label(format!("{callable_name}: multioption, flush"));

            // another value to fold? if not, we're done
            a.label(next.0, next.1.clone());
            a.next_to_o(false, true);
            a.branch_on_not_flag_to_label(done.0);

            // stash the value; create the converter on first sight,
            // flush it on every subsequent one
            a.push_o();
            a.load_o(converter_key);
            a.branch_on_flag_to_label(flush.0);
            Some((next, done, flush))
        } else {
            None
        };

        a.create_converter(parameter.clone(), converter_key);

        if let Some((_, _, flush)) = &multi_labels {
            let analyze = self.label(format!("{callable_name}: multioption, analyze value"));
            a.jump_to_label(analyze.0);

            a.label(flush.0, flush.1.clone());
            a.flush_multioption();
            a.forget_converters();

            a.label(analyze.0, analyze.1);
            a.pop_o();
            a.remember_converters();

            if only_one_parameter {
                a.wrap_o_with_iterator();
                a.push_iterator();
            } else {
                let mapping = self.label(format!("{callable_name}: multioption, value is a mapping"));
                a.test_is_o_mapping();
                a.branch_on_flag_to_label(mapping.0);
                a.abort(format!(
                    "{callable_name} takes multiple parameters, but the iterated value was a single object"
                ));
                a.label(mapping.0, mapping.1);
                by_name = true;
                a.push_mapping();
            }
        } else if nested {
            let o_is_a_mapping = self.label(format!("{callable_name}: nested, o is a mapping"));
            let process = self.label(format!("{callable_name}: nested, process arguments"));
            let name = degenerate_name.unwrap_or(&parameter.name);
            self.get_argument_to_o(&a, name, required, by_name);
            a.test_is_o_mapping();
            a.push_flag();
            a.branch_on_flag_to_label(o_is_a_mapping.0);
            if !by_name {
                a.pushback_o_to_iterator();
            }
            a.jump_to_label(process.0);
            a.label(o_is_a_mapping.0, o_is_a_mapping.1);
            a.push_mapping();
            a.label(process.0, process.1);
        }

        for child in signature.params.clone() {
            if matches!(child.kind, ParamKind::VarPositional | ParamKind::VarKeyword) {
                return Err(ConfigError::other(format!(
                    "{callable_name}: parameter {} is unsupported when reading from a mapping",
                    child.name
                ))
                .into());
            }

            let child_class = self
                .factories
                .converter_for(&child, self.registry, &callable_name)?;
            let child_multi = child_class.is_multi();
            let child_required = child.default.is_none();
            let child_discretionary = !child_required;
            let child_write_to_kwargs = child.kind == ParamKind::KeywordOnly
                || (child.kind == ParamKind::PositionalOrKeyword && child_discretionary);

            if child_class == ConverterClass::Simple(ScalarKind::Str) {
                let name = degenerate_name.unwrap_or(&child.name).to_string();
                self.get_argument_to_o(&a, &name, child_required, by_name);

                let got = self.label(format!("{}: got value", child.name));
                a.branch_on_flag_to_label(got.0);
                if child_discretionary {
                    a.literal_to_o(child.default.clone().unwrap_or_default());
                } else {
                    a.abort(format!("{name} is required but was not set in the mapping"));
                }
                a.label(got.0, got.1);
            } else {
                if child_multi {
                    let name = degenerate_name.unwrap_or(&child.name).to_string();
                    self.get_argument_to_o(&a, &name, child_required, by_name);

                    let got = self.label(format!("{}: got value", child.name));
                    a.branch_on_flag_to_label(got.0);
                    if child_discretionary {
                        a.literal_to_o(child.default.clone().unwrap_or_default());
                    } else {
                        a.abort(format!("{name} is required but was not set in the mapping"));
                    }
                    a.label(got.0, got.1);

                    let iterable = self.label(format!("{}: value is iterable", child.name));
                    a.test_is_o_iterable();
                    a.branch_on_flag_to_label(iterable.0);
                    a.abort(format!("{name} must be an iterable of values"));
                    a.label(iterable.0, iterable.1);
                    a.push_iterator();
                }

                let child_degenerate_name = degenerate_name.unwrap_or(&child.name).to_string();
                let (child_key, child_is_degenerate) = self.compile_parameter(
                    &child,
                    by_name,
                    Some(&child_degenerate_name),
                    depth + 1,
                    false,
                )?;

                if child_multi {
                    a.pop_iterator();
                    is_degenerate = false;
                }
                a.load_o(child_key);
                is_degenerate = is_degenerate && child_is_degenerate;
            }

            a.load_converter(converter_key);
            if child_write_to_kwargs {
                a.set_in_converter_kwargs(child.name.clone(), None);
            } else {
                a.append_to_converter_args(child.name.clone(), None, false);
            }
        }

        if let Some((next, done, _)) = multi_labels {
            if only_one_parameter {
                a.pop_iterator();
            } else {
                a.pop_mapping();
            }
            a.jump_to_label(next.0);
            a.label(done.0, done.1);
            a.forget_converters();
        } else if nested {
            let done = self.label(format!("{callable_name}: nested, done"));
            a.pop_flag();
            a.branch_on_not_flag_to_label(done.0);
            a.pop_mapping();
            a.label(done.0, done.1);
        }

        Ok((converter_key, is_degenerate))
    }
}
