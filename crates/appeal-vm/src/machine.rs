//! The two-loop interpreter.
//!
//! Loop A fetches and dispatches bytecode. When it reaches a `NextToO`
//! it pauses, and loop B examines the token stream: positional tokens are
//! handed to the waiting instruction, option tokens are resolved against
//! the scope stack and their sub-programs called, `--` switches off
//! option recognition. The pending `NextToO` is rewound when an option
//! takes precedence, so the same instruction resumes after the option's
//! program ends.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use appeal_compiler::{CharmProgram, ConverterKey, GroupId, GroupSpec, Instruction};
use appeal_core::{
    AppealError, CallableRegistry, ConfigError, ConverterClass, FactoryRegistry, InternalError,
    OptionKey, ParamSpec, ParseFlags, UsageError, Value,
};

use crate::converter::{ConverterArena, ConverterIx, Slot};
use crate::options::{MappedOption, OptionScopes};
use crate::tokens::TokenStream;

/// The `o` register: a string, a value, a converter, or a jump address.
#[derive(Debug, Clone, Default)]
enum Reg {
    #[default]
    None,
    Str(String),
    Value(Value),
    Converter(ConverterIx),
    Addr(usize),
}

impl Reg {
    fn from_token(token: Value) -> Reg {
        match token {
            Value::Str(s) => Reg::Str(s),
            other => Reg::Value(other),
        }
    }

    fn to_value(&self) -> Option<Value> {
        match self {
            Reg::None => Some(Value::Null),
            Reg::Str(s) => Some(Value::Str(s.clone())),
            Reg::Value(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn to_slot(&self) -> Option<Slot> {
        match self {
            Reg::Str(s) => Some(Slot::Str(s.clone())),
            Reg::Value(v) => Some(Slot::Value(v.clone())),
            Reg::Converter(ix) => Some(Slot::Converter(*ix)),
            Reg::None => Some(Slot::Value(Value::Null)),
            Reg::Addr(_) => None,
        }
    }
}

/// Entries on the data stack.
#[derive(Debug, Clone)]
enum Datum {
    Reg(Reg),
    Flag(bool),
}

/// One runtime argument group.
#[derive(Debug, Clone)]
struct RuntimeGroup {
    id: GroupId,
    optional: bool,
    minimum: usize,
    maximum: usize,
    count: usize,
    /// Set the first time anything in the group is consumed, including
    /// invoking an option mapped in the group.
    laden: bool,
}

impl RuntimeGroup {
    fn from_spec(spec: &GroupSpec) -> Self {
        Self {
            id: spec.id,
            optional: spec.optional,
            minimum: spec.minimum,
            maximum: spec.maximum,
            count: 0,
            laden: false,
        }
    }

    fn satisfied(&self) -> bool {
        if self.optional && !(self.laden || self.count > 0) {
            return true;
        }
        self.minimum <= self.count && self.count <= self.maximum
    }

    fn describe(&self) -> String {
        let plural = |n: usize| if n == 1 { "argument" } else { "arguments" };
        if self.minimum == self.maximum {
            format!("{} {}", self.minimum, plural(self.minimum))
        } else {
            format!(
                "at least {} {} but no more than {} {}",
                self.minimum,
                plural(self.minimum),
                self.maximum,
                plural(self.maximum)
            )
        }
    }
}

/// How loop B ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Control returns to loop A (or the run is over).
    Continue,
    /// The program finished with a positional token left over.
    Finished,
}

/// A saved call-stack frame.
struct Frame {
    program: Arc<CharmProgram>,
    ip: Option<usize>,
    converter: Option<ConverterIx>,
    o: Reg,
    flag: bool,
    group: Option<usize>,
}

/// One interpreter instance: owns every piece of mutable parse state.
pub struct Machine<'r> {
    registry: &'r CallableRegistry,
    factories: &'r FactoryRegistry,
    flags: ParseFlags,

    program: Arc<CharmProgram>,
    root_program: Arc<CharmProgram>,
    ip: Option<usize>,
    call_stack: Vec<Frame>,

    converter: Option<ConverterIx>,
    o: Reg,
    flag: bool,
    group: Option<usize>,

    data_stack: Vec<Datum>,
    iterator: Option<TokenStream>,
    iterator_stack: Vec<Option<TokenStream>>,
    mapping: Option<Value>,
    mapping_stack: Vec<Option<Value>>,

    pub arena: ConverterArena,
    converters: FxHashMap<ConverterKey, ConverterIx>,
    remembered: Option<FxHashSet<ConverterKey>>,
    remembered_stack: Vec<Option<FxHashSet<ConverterKey>>>,

    groups: Vec<RuntimeGroup>,
    id_to_group: FxHashMap<GroupId, usize>,

    options: OptionScopes,
    command_converter: Option<(ConverterKey, ConverterIx)>,
    force_positional: bool,
    /// Set when a top-level (non-oparg) positional was just consumed; the
    /// append that binds it triggers sibling-option expiry.
    pending_expiry: bool,
}

impl<'r> Machine<'r> {
    pub fn new(
        registry: &'r CallableRegistry,
        factories: &'r FactoryRegistry,
        flags: ParseFlags,
        program: Arc<CharmProgram>,
    ) -> Self {
        Self {
            registry,
            factories,
            flags,
            root_program: program.clone(),
            program,
            ip: Some(0),
            call_stack: Vec::new(),
            converter: None,
            o: Reg::None,
            flag: false,
            group: None,
            data_stack: Vec::new(),
            iterator: None,
            iterator_stack: Vec::new(),
            mapping: None,
            mapping_stack: Vec::new(),
            arena: ConverterArena::new(),
            converters: FxHashMap::default(),
            remembered: None,
            remembered_stack: Vec::new(),
            groups: Vec::new(),
            id_to_group: FxHashMap::default(),
            options: OptionScopes::new(),
            command_converter: None,
            force_positional: false,
            pending_expiry: false,
        }
    }

    /// Attach a command-line token source.
    pub fn with_tokens(mut self, tokens: impl IntoIterator<Item = String>) -> Self {
        self.iterator = Some(TokenStream::from_strings(tokens));
        self
    }

    /// Attach a row of already-typed values.
    pub fn with_values(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.iterator = Some(TokenStream::new(values));
        self
    }

    /// Attach a mapping source.
    pub fn with_mapping(mut self, mapping: Value) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Tokens left unconsumed after the run, if any.
    pub fn remaining_tokens(&mut self) -> Vec<Value> {
        let mut remaining = Vec::new();
        if let Some(iterator) = &mut self.iterator {
            while let Some(token) = iterator.next() {
                remaining.push(token);
            }
        }
        remaining
    }

    // ======================================================================
    // Frame and fetch machinery
    // ======================================================================

    fn running(&self) -> bool {
        let ip_active =
            |ip: Option<usize>, program: &CharmProgram| ip.is_some_and(|ip| ip < program.len());
        ip_active(self.ip, &self.program)
            || self
                .call_stack
                .iter()
                .any(|frame| ip_active(frame.ip, &frame.program))
    }

    fn has_tokens(&self) -> bool {
        self.iterator.as_ref().is_some_and(|i| !i.is_empty())
    }

    fn end_frame(&mut self) {
        match self.call_stack.pop() {
            Some(frame) => {
                self.program = frame.program;
                self.ip = frame.ip;
                self.converter = frame.converter;
                self.o = frame.o;
                self.flag = frame.flag;
                self.group = frame.group;
            }
            None => self.ip = None,
        }
    }

    fn call(&mut self, program: Arc<CharmProgram>) {
        self.call_stack.push(Frame {
            program: std::mem::replace(&mut self.program, program),
            ip: self.ip,
            converter: self.converter,
            o: std::mem::take(&mut self.o),
            flag: self.flag,
            group: self.group,
        });
        self.ip = Some(0);
        self.converter = None;
        self.flag = false;
        self.group = None;
    }

    fn fetch(&mut self) -> Option<Instruction> {
        loop {
            match self.ip {
                Some(ip) if ip < self.program.len() => {
                    let instruction = self.program.code[ip].clone();
                    self.ip = Some(ip + 1);
                    return Some(instruction);
                }
                Some(_) => {
                    // ran off the end of a program: pop a frame
                    self.end_frame();
                    self.ip?;
                }
                None => return None,
            }
        }
    }

    fn rewind_one_instruction(&mut self) -> Result<(), InternalError> {
        match self.ip {
            Some(ip) if ip > 0 => {
                self.ip = Some(ip - 1);
                Ok(())
            }
            _ => Err(InternalError::new("rewind with no instruction pending")),
        }
    }

    fn jump(&mut self, address: usize) -> Result<(), InternalError> {
        if address >= self.program.len() {
            return Err(InternalError::new(format!(
                "jump outside current program: {address} >= {}",
                self.program.len()
            )));
        }
        self.ip = Some(address);
        Ok(())
    }

    // ======================================================================
    // Converter bookkeeping
    // ======================================================================

    fn create_converter(&mut self, param: &ParamSpec, key: ConverterKey) -> Result<(), AppealError> {
        let class = self
            .factories
            .converter_for(param, self.registry, &self.program.name)?;
        let name = match &class {
            ConverterClass::Single(id) | ConverterClass::Multi(id) => {
                self.registry.get(*id)?.name.clone()
            }
            _ => param.name.clone(),
        };
        let ix = self.arena.alloc(class, param.clone(), name);
        self.converters.insert(key, ix);
        self.o = Reg::Converter(ix);
        if self.command_converter.is_none() {
            self.command_converter = Some((key, ix));
        }
        if let Some(remembered) = &mut self.remembered {
            remembered.insert(key);
        }
        Ok(())
    }

    fn remember_converters(&mut self) {
        self.remembered_stack.push(self.remembered.take());
        self.remembered = Some(FxHashSet::default());
    }

    fn forget_converters(&mut self) -> Result<(), InternalError> {
        let keys = self
            .remembered
            .take()
            .ok_or_else(|| InternalError::new("forget_converters without remember_converters"))?;
        for key in keys {
            self.converters.remove(&key);
        }
        self.remembered = self
            .remembered_stack
            .pop()
            .ok_or_else(|| InternalError::new("remember/forget stack underflow"))?;
        Ok(())
    }

    fn current_converter(&self) -> Result<ConverterIx, InternalError> {
        self.converter
            .ok_or_else(|| InternalError::new("no converter loaded"))
    }

    fn o_slot(&self) -> Result<Slot, InternalError> {
        self.o
            .to_slot()
            .ok_or_else(|| InternalError::new("o register does not hold an appendable value"))
    }

    fn o_value(&self) -> Result<Value, InternalError> {
        self.o
            .to_value()
            .ok_or_else(|| InternalError::new("o register does not hold a value"))
    }

    // ======================================================================
    // Execution
    // ======================================================================

    /// Run the program to completion. Returns the root converter, ready
    /// for the conversion and execution passes.
    pub fn run(&mut self) -> Result<ConverterIx, AppealError> {
        while self.running() || self.has_tokens() {
            // Loop A: dispatch bytecode until the program needs a token.
            let pending = self.run_bytecode()?;

            // Loop B: consume command-line tokens.
            if self.consume_tokens(pending)? == Flow::Finished {
                // the program is over and a positional token is left;
                // it stays pushed back for whoever parses next
                let (_, root) = self.command_converter.ok_or_else(|| {
                    InternalError::new("program finished without creating a root converter")
                })?;
                return Ok(root);
            }
        }

        // Termination: the current group must be satisfied.
        if let Some(group_ix) = self.group {
            let group = &self.groups[group_ix];
            if !group.satisfied() {
                return Err(UsageError::GroupNotSatisfied {
                    program: self.program.name.clone(),
                    arguments: group.describe(),
                }
                .into());
            }
        }

        let (_, root) = self.command_converter.ok_or_else(|| {
            InternalError::new("program finished without creating a root converter")
        })?;
        Ok(root)
    }

    /// Loop A. Returns the pending `NextToO` operands when the program
    /// pauses for a token, or `None` when it finished.
    fn run_bytecode(&mut self) -> Result<Option<(bool, bool)>, AppealError> {
        while let Some(instruction) = self.fetch() {
            log::trace!("[{}] {}", self.program.id, instruction.name());
            match instruction {
                Instruction::NextToO { required, is_oparg } => {
                    return Ok(Some((required, is_oparg)));
                }

                Instruction::End => self.end_frame(),
                Instruction::Abort { message } => {
                    return Err(UsageError::Other(message).into());
                }
                Instruction::Jump { address } => self.jump(address)?,
                Instruction::IndirectJump => match self.o {
                    Reg::Addr(address) => self.jump(address)?,
                    _ => {
                        return Err(
                            InternalError::new("indirect_jump: o does not hold an address").into()
                        );
                    }
                },
                Instruction::BranchOnFlag { address } => {
                    if self.flag {
                        self.jump(address)?;
                    }
                }
                Instruction::BranchOnNotFlag { address } => {
                    if !self.flag {
                        self.jump(address)?;
                    }
                }

                Instruction::LiteralToO { value } => self.o = Reg::Value(value),
                Instruction::AddressToO { address } => self.o = Reg::Addr(address),
                Instruction::WrapOWithIterator => {
                    let value = self.o_value()?;
                    self.o = Reg::Value(Value::List(vec![value]));
                }
                Instruction::LoadConverter { key } => match self.converters.get(&key) {
                    Some(ix) => {
                        self.converter = Some(*ix);
                        self.flag = true;
                    }
                    None => {
                        self.converter = None;
                        self.flag = false;
                    }
                },
                Instruction::LoadO { key } => match self.converters.get(&key) {
                    Some(ix) => {
                        self.o = Reg::Converter(*ix);
                        self.flag = true;
                    }
                    None => {
                        self.o = Reg::None;
                        self.flag = false;
                    }
                },
                Instruction::ConverterToO => {
                    self.o = match self.converter {
                        Some(ix) => Reg::Converter(ix),
                        None => Reg::None,
                    };
                }

                Instruction::TestIsOTrue => {
                    self.flag = match &self.o {
                        Reg::None => false,
                        Reg::Str(s) => !s.is_empty(),
                        Reg::Value(v) => v.is_truthy(),
                        Reg::Converter(_) => true,
                        Reg::Addr(_) => true,
                    };
                }
                Instruction::TestIsONone => {
                    self.flag = matches!(&self.o, Reg::None | Reg::Value(Value::Null));
                }
                Instruction::TestIsOEmpty => {
                    self.flag = matches!(&self.o, Reg::None);
                }
                Instruction::TestIsOIterable => {
                    self.flag = matches!(&self.o, Reg::Value(Value::List(_)));
                }
                Instruction::TestIsOMapping => {
                    self.flag = matches!(&self.o, Reg::Value(Value::Map(_)));
                }
                Instruction::TestIsOStrOrBytes => {
                    self.flag = matches!(&self.o, Reg::Str(_) | Reg::Value(Value::Str(_)));
                }

                Instruction::PushO => self.data_stack.push(Datum::Reg(self.o.clone())),
                Instruction::PopO => {
                    let datum = self
                        .data_stack
                        .pop()
                        .ok_or_else(|| InternalError::new("pop_o on empty data stack"))?;
                    self.o = match datum {
                        Datum::Reg(reg) => reg,
                        Datum::Flag(flag) => Reg::Value(Value::Bool(flag)),
                    };
                }
                Instruction::PeekO => {
                    let datum = self
                        .data_stack
                        .last()
                        .ok_or_else(|| InternalError::new("peek_o on empty data stack"))?;
                    self.o = match datum {
                        Datum::Reg(reg) => reg.clone(),
                        Datum::Flag(flag) => Reg::Value(Value::Bool(*flag)),
                    };
                }
                Instruction::PushFlag => self.data_stack.push(Datum::Flag(self.flag)),
                Instruction::PopFlag => {
                    let datum = self
                        .data_stack
                        .pop()
                        .ok_or_else(|| InternalError::new("pop_flag on empty data stack"))?;
                    self.flag = match datum {
                        Datum::Flag(flag) => flag,
                        Datum::Reg(reg) => reg.to_value().is_some_and(|v| v.is_truthy()),
                    };
                }

                Instruction::PushIterator => {
                    let value = self.o_value()?;
                    let Value::List(values) = value else {
                        return Err(
                            InternalError::new("push_iterator: o is not iterable").into()
                        );
                    };
                    self.iterator_stack.push(self.iterator.take());
                    self.iterator = Some(TokenStream::new(values));
                }
                Instruction::PopIterator => {
                    self.iterator = self
                        .iterator_stack
                        .pop()
                        .ok_or_else(|| InternalError::new("pop_iterator on empty stack"))?;
                }
                Instruction::PushbackOToIterator => {
                    let value = self.o_value()?;
                    let iterator = self
                        .iterator
                        .as_mut()
                        .ok_or_else(|| InternalError::new("pushback with no iterator"))?;
                    iterator.push(value);
                }
                Instruction::PushMapping => {
                    let value = self.o_value()?;
                    if !matches!(value, Value::Map(_)) {
                        return Err(InternalError::new("push_mapping: o is not a mapping").into());
                    }
                    self.mapping_stack.push(self.mapping.take());
                    self.mapping = Some(value);
                }
                Instruction::PopMapping => {
                    self.mapping = self
                        .mapping_stack
                        .pop()
                        .ok_or_else(|| InternalError::new("pop_mapping on empty stack"))?;
                }

                Instruction::CreateConverter { param, key } => {
                    self.create_converter(&param, key)?;
                }
                Instruction::AppendToConverterArgs {
                    discretionary, ..
                } => {
                    let owner = self.current_converter()?;
                    let slot = self.o_slot()?;
                    if discretionary {
                        let Slot::Converter(child) = slot else {
                            return Err(InternalError::new(
                                "discretionary append of a non-converter",
                            )
                            .into());
                        };
                        self.arena.queue_converter(owner, child);
                    } else {
                        let is_string = matches!(slot, Slot::Str(_));
                        self.arena.append_converter(owner, slot);
                        if is_string && self.pending_expiry {
                            // the parse committed a top-level positional
                            // to this subtree: options belonging to
                            // disjoint sibling subtrees fall out of scope
                            self.pending_expiry = false;
                            let arena = &self.arena;
                            self.options.retain(|mapped| arena.related(mapped.owner, owner));
                        }
                    }
                }
                Instruction::SetInConverterKwargs { param, .. } => {
                    let owner = self.current_converter()?;
                    let slot = self.o_slot()?;
                    let option_name = self.program.name.clone();
                    self.arena.set_kwarg(owner, &param, slot, &option_name)?;
                }
                Instruction::FlushMultioption => {
                    let Reg::Converter(ix) = self.o else {
                        return Err(
                            InternalError::new("flush_multioption: o is not a converter").into()
                        );
                    };
                    self.arena.flush_multioption(ix)?;
                }
                Instruction::RememberConverters => self.remember_converters(),
                Instruction::ForgetConverters => self.forget_converters()?,

                Instruction::SetGroup { spec } => {
                    let group = RuntimeGroup::from_spec(&spec);
                    let ix = self.groups.len();
                    self.id_to_group.insert(group.id, ix);
                    self.groups.push(group);
                    self.group = Some(ix);
                }
                Instruction::MapOption {
                    group,
                    option,
                    program,
                    key,
                    ..
                } => {
                    let owner = *self.converters.get(&key).ok_or_else(|| {
                        InternalError::new(format!(
                            "map_option {option} references converter {key} before creation"
                        ))
                    })?;
                    self.options
                        .insert(option, MappedOption { program, group, owner });
                }
                Instruction::LookupToO { key, required } => {
                    let found = self
                        .mapping
                        .as_ref()
                        .and_then(|mapping| mapping.get(&key))
                        .cloned();
                    match found {
                        Some(value) => {
                            self.o = Reg::Value(value);
                            self.flag = true;
                        }
                        None => {
                            self.o = Reg::None;
                            self.flag = false;
                            if required {
                                return Err(UsageError::MissingKey { name: key }.into());
                            }
                        }
                    }
                }

                pseudo @ (Instruction::NoOp
                | Instruction::Comment { .. }
                | Instruction::Label { .. }
                | Instruction::JumpToLabel { .. }
                | Instruction::BranchOnFlagToLabel { .. }
                | Instruction::BranchOnNotFlagToLabel { .. }
                | Instruction::LabelToO { .. }) => {
                    return Err(ConfigError::other(format!(
                        "unassembled pseudo-instruction reached the interpreter: {}",
                        pseudo.name()
                    ))
                    .into());
                }
            }
        }
        Ok(None)
    }

    /// Loop B. `pending` holds the operands of the `NextToO` the program
    /// paused on, or `None` when the program already finished.
    fn consume_tokens(&mut self, mut pending: Option<(bool, bool)>) -> Result<Flow, AppealError> {
        loop {
            if !self.has_tokens() {
                if let (Some((required, _)), false) = (pending, self.iterator_stack.is_empty()) {
                    // a *pushed* iterator ran dry: report the miss to the
                    // program and let its compiled fallback branch decide
                    if required {
                        return Err(UsageError::other(format!(
                            "{} ran out of values",
                            self.program.name
                        ))
                        .into());
                    }
                    self.o = Reg::None;
                    self.flag = false;
                    return Ok(Flow::Continue);
                }
                // the command line is exhausted; stop running and let the
                // termination check decide whether that's an error
                self.ip = None;
                self.call_stack.clear();
                return Ok(Flow::Continue);
            }

            while let Some(token) = self.iterator.as_mut().and_then(TokenStream::next) {
                let is_oparg = pending.is_some_and(|(_, is_oparg)| is_oparg);
                let mut is_positional = self.force_positional || is_oparg;
                if !is_positional {
                    is_positional = match &token {
                        Value::Str(s) => !s.starts_with('-') || s == "-",
                        // non-string values can't be options
                        _ => true,
                    };
                }

                if is_positional {
                    if pending.is_none() {
                        // the program finished but a token remains; push
                        // it back for whoever runs next
                        if let Some(iterator) = &mut self.iterator {
                            iterator.push(token);
                        }
                        return Ok(Flow::Finished);
                    }
                    self.o = Reg::from_token(token);
                    self.flag = true;
                    self.pending_expiry = !is_oparg;
                    if let Some(group_ix) = self.group {
                        let group = &mut self.groups[group_ix];
                        group.count += 1;
                        group.laden = true;
                    }
                    if !is_oparg {
                        // committing to a new positional unmaps every
                        // child option scope
                        self.options.unmap_all_children();
                    }
                    return Ok(Flow::Continue);
                }

                // it's an option token
                let Value::Str(spelling) = token else {
                    return Err(InternalError::new("non-string token took the option path").into());
                };

                if !self.flags.contains(ParseFlags::OPTION_SPACE_OPARG) {
                    return Err(ConfigError::other(
                        "the only supported value of OPTION_SPACE_OPARG is on",
                    )
                    .into());
                }

                if spelling == "--" {
                    self.force_positional = true;
                    continue;
                }

                if self.dispatch_option(&spelling, &mut pending)? {
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// Resolve and call one option token. Returns true when an option
    /// program was called (loop B ends; loop A resumes).
    fn dispatch_option(
        &mut self,
        spelling: &str,
        pending: &mut Option<(bool, bool)>,
    ) -> Result<bool, AppealError> {
        let double_dash = spelling.starts_with("--");

        // split off a "=value" oparg; it is pushed back onto the stream
        // after the option resolves, so the option program consumes it
        let mut body = spelling.to_string();
        let mut split_value: Option<String> = None;
        if double_dash || self.flags.contains(ParseFlags::SHORT_OPTION_EQUALS_OPARG) {
            if let Some(eq) = body.find('=') {
                split_value = Some(body[eq + 1..].to_string());
                body.truncate(eq);
            }
        }

        let (option, mapped, scope_token) = if double_dash {
            let option = OptionKey::Long(body.trim_start_matches('-').to_string());
            let (mapped, scope_token) = self.resolve_option(&option)?;
            (option, mapped, scope_token)
        } else {
            // short options: peel one character off the cluster
            let mut characters = body.chars();
            characters.next();
            let Some(short) = characters.next() else {
                return Err(UsageError::UnknownOption {
                    option: spelling.to_string(),
                }
                .into());
            };
            let option = OptionKey::Short(short);
            let (mapped, scope_token) = self.resolve_option(&option)?;

            let remainder: String = characters.collect();
            if !remainder.is_empty() {
                let minimum = mapped.program.total.minimum;
                let maximum = mapped.program.total.maximum;
                match maximum {
                    Some(0) => {
                        // the rest of the cluster is more short options
                        if let Some(iterator) = &mut self.iterator {
                            iterator.push(Value::str(format!("-{remainder}")));
                        }
                    }
                    Some(1)
                        if minimum == 0
                            && self
                                .flags
                                .contains(ParseFlags::SHORT_OPTION_CONCATENATED_OPARG)
                            && split_value.is_none() =>
                    {
                        // -sVALUE: legal only for exactly one optional oparg
                        split_value = Some(remainder);
                    }
                    _ => {
                        return Err(UsageError::OptionMustBeLast {
                            option: short,
                            remainder,
                            arguments: mapped.program.total.describe(),
                        }
                        .into());
                    }
                }
            }
            (option, mapped, scope_token)
        };

        // mark the owning group laden even if no argument lands in it
        let group_ix = self
            .id_to_group
            .get(&mapped.group)
            .copied()
            .ok_or_else(|| {
                InternalError::new(format!("option {option} maps into a group never entered"))
            })?;
        self.groups[group_ix].laden = true;

        // the option takes precedence over the pending next_to_o; the
        // same instruction resumes after the option program ends
        if pending.take().is_some() {
            self.rewind_one_instruction()?;
        }

        // drop child scopes above the option's own scope, then open a
        // fresh scope for whatever the option maps
        self.options.pop_until(scope_token)?;
        self.options.push();

        if let Some(value) = split_value {
            match mapped.program.total.maximum {
                Some(1) => {}
                Some(0) => {
                    return Err(UsageError::OptionTakesNoArgument {
                        option: option.denormalize(),
                        value,
                    }
                    .into());
                }
                _ => {
                    return Err(UsageError::OptionTakesMultipleArguments {
                        option: option.denormalize(),
                        value,
                    }
                    .into());
                }
            }
            if let Some(iterator) = &mut self.iterator {
                iterator.push(Value::Str(value));
            }
        }

        log::debug!("option {option} calls program {}", mapped.program.id);
        self.call(mapped.program);
        Ok(true)
    }

    fn resolve_option(
        &self,
        option: &OptionKey,
    ) -> Result<(MappedOption, crate::options::ScopeToken), UsageError> {
        if let Some(found) = self.options.lookup(option) {
            return Ok(found);
        }
        let parents = self.program.option_to_parent_options.get(option);
        match parents {
            Some(parents) if !parents.is_empty() => {
                let mut spelled: Vec<String> =
                    parents.iter().map(OptionKey::denormalize).collect();
                spelled.sort();
                let parents = match spelled.len() {
                    1 => spelled.remove(0),
                    _ => {
                        let last = spelled.pop().unwrap_or_default();
                        format!("{} or {}", spelled.join(", "), last)
                    }
                };
                Err(UsageError::OptionOutOfScope {
                    option: option.denormalize(),
                    parents,
                })
            }
            _ => Err(UsageError::UnknownOption {
                option: option.denormalize(),
            }),
        }
    }

    /// Run the conversion and execution passes on the finished tree and
    /// return the final value.
    pub fn evaluate(&mut self, root: ConverterIx) -> Result<Value, AppealError> {
        self.arena.convert(root, self.registry)?;
        Ok(self.arena.execute(root, self.registry)?)
    }

    /// The program this machine was started with.
    pub fn root_program(&self) -> &Arc<CharmProgram> {
        &self.root_program
    }
}
