//! The command and option compilers.
//!
//! Both walk the analyzer's output over an annotation tree and lower it
//! into Charm bytecode. They share one implementation parameterized by
//! [`CompileTarget`]: the only differences are that option programs read
//! opargs (`NextToO { is_oparg: true }`) and hang off a `MapOption` in
//! their parent program.
//!
//! Every argument group is emitted through a quartet of assemblers:
//!
//! * an *initialize* section — `set_group`, then every `create_converter`
//!   for converters whose parameters fall in the group;
//! * an *options* section — `map_option` for options first seen in this
//!   group, spliced onto the end of the initialize section when the group
//!   is finished;
//! * a *body* section — token consumption and converter wiring;
//! * a *duplicate options* section inside the body, recreated after every
//!   consumed positional — mapping the same option twice in one group is
//!   only legal with a positional consumption between the mappings.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use appeal_analysis::{GrouperIter, ParameterGrouper};
use appeal_core::{
    Annotation, AppealError, CallableId, CallableRegistry, ConfigError, ConverterClass,
    FactoryRegistry, InternalError, OptionKey, ParamKind, ParamSpec, ScalarKind, Signature,
    converter_signature,
};

use crate::assembler::Assembler;
use crate::instruction::{ConverterKey, GroupId, LabelId};
use crate::program::CharmProgram;

/// Which flavor of program is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileTarget {
    Command,
    Option,
}

/// Allocators shared between a command compilation and every option
/// sub-compilation nested inside it. Converter keys in particular must be
/// unique across the whole program tree, because all programs fill one
/// `converters` map at runtime.
#[derive(Default)]
struct SharedCounters {
    next_key: Cell<u32>,
    next_group: Cell<u32>,
    next_label: Cell<u32>,
}

type Counters = Rc<SharedCounters>;

/// Compile a registered command callable into a Charm program.
pub fn compile_command(
    registry: &CallableRegistry,
    factories: &FactoryRegistry,
    callable: CallableId,
) -> Result<Arc<CharmProgram>, AppealError> {
    let entry = registry.get(callable)?;
    let spec = ParamSpec::new(entry.name.clone(), ParamKind::PositionalOnly)
        .with_annotation(Annotation::Callable(callable));
    let mut compiler = Compiler::new(
        registry,
        factories,
        CompileTarget::Command,
        entry.name.clone(),
        Counters::default(),
    );
    compiler.compile(&spec)?;
    let program = compiler.assemble()?;
    log::debug!("compiled command {:?}: {}", program.name, program.total.describe());
    Ok(Arc::new(program))
}

pub(crate) struct Compiler<'r> {
    registry: &'r CallableRegistry,
    factories: &'r FactoryRegistry,
    target: CompileTarget,
    name: String,
    counters: Counters,

    root_a: Assembler,
    add_to_parent_a: Assembler,
    command_converter_key: Option<ConverterKey>,

    has_group: bool,
    group_id: GroupId,
    ag_initialize_a: Assembler,
    ag_options_a: Assembler,
    body_a: Assembler,
    ag_duplicate_options_a: Option<Assembler>,
    ag_options: FxHashSet<OptionKey>,
    ag_duplicate_options: FxHashSet<OptionKey>,
}

impl<'r> Compiler<'r> {
    fn new(
        registry: &'r CallableRegistry,
        factories: &'r FactoryRegistry,
        target: CompileTarget,
        name: String,
        counters: Counters,
    ) -> Self {
        let root_a = Assembler::new(name.clone());
        Self {
            registry,
            factories,
            target,
            name,
            counters,
            root_a,
            add_to_parent_a: Assembler::new("unset"),
            command_converter_key: None,
            has_group: false,
            group_id: GroupId(0),
            ag_initialize_a: Assembler::new("unset"),
            ag_options_a: Assembler::new("unset"),
            body_a: Assembler::new("unset"),
            ag_duplicate_options_a: None,
            ag_options: FxHashSet::default(),
            ag_duplicate_options: FxHashSet::default(),
        }
    }

    fn next_converter_key(&self) -> ConverterKey {
        let key = self.counters.next_key.get();
        self.counters.next_key.set(key + 1);
        ConverterKey(key)
    }

    fn next_group_id(&self) -> GroupId {
        let id = self.counters.next_group.get();
        self.counters.next_group.set(id + 1);
        GroupId(id)
    }

    fn next_label(&self) -> LabelId {
        let id = self.counters.next_label.get();
        self.counters.next_label.set(id + 1);
        LabelId(id)
    }

    fn compile(&mut self, parameter: &ParamSpec) -> Result<(), AppealError> {
        self.new_argument_group(false);

        let grouper = ParameterGrouper::for_param(parameter, self.registry, self.factories)?;
        let mut pgi = grouper.iter_all();

        self.add_to_parent_a = self.compile_parameter(parameter, &mut pgi, 0)?;
        Ok(())
    }

    fn assemble(&mut self) -> Result<CharmProgram, AppealError> {
        self.clean_up_argument_group();
        Ok(self.root_a.assemble()?)
    }

    /// Close out the current argument group: splice its options section
    /// into the end of its initialize section, and drop sections that
    /// ended up holding nothing but their own header comment.
    fn clean_up_argument_group(&mut self) {
        if !self.has_group {
            return;
        }
        if !self.ag_options.is_empty() {
            self.ag_initialize_a.append_assembler(&self.ag_options_a);
            self.ag_options.clear();
        }
        self.ag_initialize_a.clear_if_inert();
        self.ag_options_a.clear_if_inert();
        if let Some(duplicates) = &self.ag_duplicate_options_a {
            duplicates.clear_if_inert();
        }
        self.body_a.clear_if_inert();
    }

    fn new_argument_group(&mut self, optional: bool) -> GroupId {
        self.clean_up_argument_group();

        let group_id = self.next_group_id();
        self.group_id = group_id;
        self.has_group = true;

        let ag_a = Assembler::new(format!("{} {group_id}", self.name));
        self.root_a.append_assembler(&ag_a);

        let initialize = Assembler::new(format!("'{group_id}' initialize"));
        initialize.comment(format!(
            "{} argument group '{group_id}' initialization",
            self.name
        ));
        ag_a.append_assembler(&initialize);

        let options = Assembler::new(format!("'{group_id}' options"));
        options.comment(format!("{} argument group '{group_id}' options", self.name));

        let body = Assembler::new(format!("'{group_id}' body"));
        body.comment(format!("{} argument group '{group_id}' body", self.name));
        ag_a.append_assembler(&body);

        self.ag_initialize_a = initialize;
        self.ag_options_a = options;
        self.body_a = body;
        self.ag_duplicate_options_a = None;
        self.ag_duplicate_options.clear();

        self.ag_initialize_a.set_group(group_id, optional);
        group_id
    }

    /// Open a fresh duplicate-options window. Called immediately after a
    /// positional is consumed — and nowhere else; this is the single
    /// point that defines when a re-mapped option becomes legal again.
    fn reset_duplicate_options(&mut self) {
        if !self.ag_duplicate_options.is_empty() {
            self.ag_duplicate_options.clear();
        } else if let Some(duplicates) = &self.ag_duplicate_options_a {
            duplicates.clear();
        }

        let duplicates = Assembler::new(format!("{} duplicate options", self.group_id));
        duplicates.comment(format!(
            "{} argument group {} duplicate options",
            self.name, self.group_id
        ));
        self.body_a.append_assembler(&duplicates);
        self.ag_duplicate_options_a = Some(duplicates);
    }

    /// Converters for parameters that may never be exercised get queued
    /// instead of appended; see the interpreter's discretionary handling.
    fn is_converter_discretionary(parameter: &ParamSpec) -> bool {
        parameter.kind == ParamKind::VarPositional || parameter.default.is_some()
    }

    /// Compile one parameter and the subtree under it.
    ///
    /// Returns the "add to parent" assembler: a section positioned right
    /// after this parameter's converter is created, into which the caller
    /// appends the `load_converter` + `append_to_converter_args` (or
    /// kwargs) wiring.
    fn compile_parameter(
        &mut self,
        parameter: &ParamSpec,
        pgi: &mut GrouperIter<'_>,
        depth: usize,
    ) -> Result<Assembler, AppealError> {
        let class = self
            .factories
            .converter_for(parameter, self.registry, &self.name)?;
        let callable_id = match class {
            ConverterClass::Single(id) | ConverterClass::Multi(id) => Some(id),
            _ => None,
        };
        let callable_name = match &class {
            ConverterClass::Single(id) | ConverterClass::Multi(id) => {
                self.registry.get(*id)?.name.clone()
            }
            ConverterClass::Simple(kind) => kind.type_name().to_string(),
            _ => parameter.name.clone(),
        };
        let signature = converter_signature(&class, self.registry)?;

        let converter_key = self.next_converter_key();
        if self.command_converter_key.is_none() {
            self.command_converter_key = Some(converter_key);
        }

        let initialize = self.ag_initialize_a.clone();
        let multioption = class.is_multi();
        let multi_labels = if multioption {
            let flush = self.next_label();
            let after = self.next_label();
            initialize.load_o(converter_key);
            initialize.test_is_o_true();
            initialize.branch_on_flag_to_label(flush);
            Some((flush, after))
        } else {
            None
        };

        initialize.create_converter(parameter.clone(), converter_key);

        let add_to_parent = Assembler::new(format!("{callable_name} {converter_key} add-to-parent"));
        add_to_parent.load_o(converter_key);
        self.body_a.append_assembler(&add_to_parent);

        if let Some((flush, after)) = multi_labels {
            initialize.jump_to_label(after);
            initialize.label(flush, format!("{callable_name} {converter_key}: flush multioption"));
            initialize.flush_multioption();
            initialize.forget_converters();
            initialize.label(after, format!("{callable_name} {converter_key}: after multioption"));
            initialize.remember_converters();
        }

        // options are delayed until the group of this callable's first
        // positional argument is known; at the root there is nothing to
        // wait for
        let mut spilled = false;
        if depth == 0 {
            self.map_options(callable_id, &signature, converter_key)?;
            spilled = true;
        }

        for p in signature.params.clone() {
            if !p.kind.is_positional() {
                continue;
            }

            let child_class = self
                .factories
                .converter_for(&p, self.registry, &callable_name)?;

            let var_positional_label = if p.kind == ParamKind::VarPositional {
                let label = self.next_label();
                self.body_a
                    .label(label, format!("{callable_name}.{}: var_positional", p.name));
                self.body_a.remember_converters();
                Some(label)
            } else {
                None
            };

            let child_usage = callable_id
                .and_then(|id| self.registry.get(id).ok())
                .map(|entry| entry.usage_name(&p.name).to_string())
                .unwrap_or_else(|| p.name.clone());

            let pgi_parameter = pgi.next().ok_or_else(|| InternalError {
                message: format!(
                    "parameter grouper exhausted at {callable_name}.{}",
                    p.name
                ),
            })?;

            if pgi_parameter.first_in_group && !pgi_parameter.in_required_group {
                self.new_argument_group(true);
            }
            if !spilled {
                self.map_options(callable_id, &signature, converter_key)?;
                spilled = true;
            }

            let (add_to_self, discretionary);
            if child_class == ConverterClass::Simple(ScalarKind::Str) {
                let required = pgi_parameter.required;
                self.body_a
                    .next_to_o(required, self.target == CompileTarget::Option);
                if !required {
                    let exit = self.next_label();
                    self.body_a.branch_on_flag_to_label(exit);
                    self.body_a.end();
                    self.body_a.label(
                        exit,
                        format!("{callable_name}.{}: exit after optional argument", p.name),
                    );
                }
                discretionary = false;
                add_to_self = self.body_a.clone();
                self.reset_duplicate_options();
            } else {
                discretionary = Self::is_converter_discretionary(&p);
                add_to_self = self.compile_parameter(&p, pgi, depth + 1)?;
            }

            add_to_self.load_converter(converter_key);
            add_to_self.append_to_converter_args(
                p.name.clone(),
                Some(child_usage),
                discretionary,
            );

            if let Some(label) = var_positional_label {
                self.root_a.mark_repeating(self.group_id);
                self.body_a.forget_converters();
                self.body_a.jump_to_label(label);
            }
        }

        if !spilled {
            self.map_options(callable_id, &signature, converter_key)?;
        }

        Ok(add_to_parent)
    }

    /// Map every option alias of this callable's keyword-only parameters
    /// into the current argument group.
    fn map_options(
        &mut self,
        callable_id: Option<CallableId>,
        signature: &Signature,
        converter_key: ConverterKey,
    ) -> Result<(), AppealError> {
        let Some(id) = callable_id else {
            return Ok(());
        };
        let entry = self.registry.get(id)?;
        let callable_name = entry.name.clone();

        let mut all_kwonly: Vec<String> = Vec::new();
        let mut var_keyword = false;
        for p in &signature.params {
            match p.kind {
                ParamKind::KeywordOnly => {
                    if p.default.is_none() {
                        return Err(ConfigError::KeywordOnlyWithoutDefault {
                            callable: callable_name,
                            name: p.name.clone(),
                        }
                        .into());
                    }
                    all_kwonly.push(p.name.clone());
                }
                ParamKind::VarKeyword => var_keyword = true,
                _ => {}
            }
        }

        // options registered against names the signature doesn't declare
        // go into **kwargs
        let mut unseen: Vec<String> = entry
            .kw_parameters
            .keys()
            .filter(|name| !all_kwonly.contains(name))
            .cloned()
            .collect();
        if !unseen.is_empty() {
            if !var_keyword {
                unseen.sort();
                return Err(ConfigError::NoVarKeyword {
                    callable: callable_name,
                    options: unseen.join(", "),
                }
                .into());
            }
            unseen.sort();
            all_kwonly.extend(unseen);
        }

        for name in all_kwonly {
            let Some(alias_entries) = entry.kw_parameters.get(&name) else {
                continue;
            };

            // aliases with the same sub-signature (annotation + default)
            // share one compiled program
            let mut work: Vec<(ParamSpec, Vec<OptionKey>)> = Vec::new();
            for alias in alias_entries {
                match work.iter_mut().find(|(p, _)| {
                    p.annotation == alias.param.annotation && p.default == alias.param.default
                }) {
                    Some((_, options)) => options.push(alias.option.clone()),
                    None => work.push((alias.param.clone(), vec![alias.option.clone()])),
                }
            }

            for (param, options) in work {
                let spelled: Vec<String> = options.iter().map(OptionKey::denormalize).collect();
                let program_name = format!("{} {}", callable_name, spelled.join(" | "));

                let option_class =
                    self.factories
                        .converter_for(&param, self.registry, &callable_name)?;
                let program = if option_class == ConverterClass::Simple(ScalarKind::Str) {
                    // hand-coded program for an option taking one
                    // required str argument
                    let a = Assembler::new(program_name);
                    a.set_group(self.next_group_id(), false);
                    a.next_to_o(true, true);
                    a.load_converter(converter_key);
                    a.set_in_converter_kwargs(name.clone(), None);
                    Arc::new(a.assemble()?)
                } else {
                    let mut sub = Compiler::new(
                        self.registry,
                        self.factories,
                        CompileTarget::Option,
                        program_name,
                        self.counters.clone(),
                    );
                    sub.compile(&param)?;
                    sub.add_to_parent_a.load_converter(converter_key);
                    sub.add_to_parent_a
                        .set_in_converter_kwargs(name.clone(), None);
                    Arc::new(sub.assemble()?)
                };

                for option in options {
                    // an option may be mapped twice in one group only if
                    // at least one positional is consumed between the two
                    // mappings
                    let destination = if !self.ag_options.contains(&option) {
                        self.ag_options.insert(option.clone());
                        self.ag_duplicate_options.insert(option.clone());
                        self.ag_options_a.clone()
                    } else if let Some(duplicates) = &self.ag_duplicate_options_a {
                        if self.ag_duplicate_options.contains(&option) {
                            return Err(ConfigError::AmbiguousDuplicateOption {
                                option: option.denormalize(),
                            }
                            .into());
                        }
                        self.ag_duplicate_options.insert(option.clone());
                        duplicates.clone()
                    } else {
                        return Err(ConfigError::AmbiguousDuplicateOption {
                            option: option.denormalize(),
                        }
                        .into());
                    };

                    destination.map_option(
                        self.group_id,
                        option,
                        program.clone(),
                        converter_key,
                        name.clone(),
                    );
                }
            }
        }
        Ok(())
    }
}
