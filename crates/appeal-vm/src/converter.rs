//! Runtime converter instances.
//!
//! Converters live in an arena; parent/child links are arena indices.
//! The interesting part is *discretionary queueing*: a converter for a
//! parameter with a default might never be needed, so it is allocated
//! eagerly but parked in its parent's `args_queue` rather than appended
//! to the real positional buffer. The first time anything in its subtree
//! receives a string argument or has an option invoked, the converter is
//! "unqueued": moved into the parent's real buffer — flushing everything
//! queued ahead of it, to preserve argument order — and the parent is
//! recursively unqueued all the way to the root.
//!
//! A skipped optional subtree therefore leaves no trace: its converters
//! exist in the arena but are referenced by nothing, and evaluation never
//! touches them.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use appeal_core::{
    CallArgs, CallableImpl, CallableRegistry, ConverterClass, InternalError, ParamSpec,
    ScalarKind, UsageError, Value,
};

/// Index of a converter in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConverterIx(pub usize);

/// One positional or keyword slot in a converter's buffers.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// A raw string from the token stream.
    Str(String),
    /// An already-typed value (mapping mode, or a literal default).
    Value(Value),
    /// A child converter.
    Converter(ConverterIx),
}

/// One converter instance.
#[derive(Debug)]
pub struct Converter {
    pub class: ConverterClass,
    /// The parameter this converter fills; carries the default used when
    /// the converter is never exercised.
    pub param: ParamSpec,
    /// Display name for diagnostics.
    pub name: String,

    /// Tree parent, set when this converter lands in a parent's buffer
    /// or queue. Used to decide whether two converters share a subtree.
    pub parent: Option<ConverterIx>,
    /// Parent link while this converter (or an ancestor) is queued.
    pub queued: Option<ConverterIx>,
    /// Discretionary children awaiting justification.
    pub args_queue: VecDeque<ConverterIx>,

    /// The real positional buffer.
    pub args: Vec<Slot>,
    /// The keyword buffer, in assignment order.
    pub kwargs: Vec<(String, Slot)>,
    /// Flushed per-invocation buffers of a multi-option.
    pub multi_invocations: Vec<(Vec<Slot>, Vec<(String, Slot)>)>,

    /// Converted positional values, built by the conversion pass.
    prepared_args: Vec<Value>,
    prepared_kwargs: Vec<(String, Value)>,
    prepared_multi: Vec<CallArgs>,
    /// Execution result, memoized so a converter runs at most once.
    value: Option<Value>,
}

impl Converter {
    fn new(class: ConverterClass, param: ParamSpec, name: String) -> Self {
        Self {
            class,
            param,
            name,
            parent: None,
            queued: None,
            args_queue: VecDeque::new(),
            args: Vec::new(),
            kwargs: Vec::new(),
            multi_invocations: Vec::new(),
            prepared_args: Vec::new(),
            prepared_kwargs: Vec::new(),
            prepared_multi: Vec::new(),
            value: None,
        }
    }

    pub fn kwarg(&self, name: &str) -> Option<&Slot> {
        self.kwargs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, slot)| slot)
    }
}

/// The per-parse converter arena.
#[derive(Debug, Default)]
pub struct ConverterArena {
    nodes: Vec<Converter>,
}

impl ConverterArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, class: ConverterClass, param: ParamSpec, name: String) -> ConverterIx {
        let ix = ConverterIx(self.nodes.len());
        self.nodes.push(Converter::new(class, param, name));
        ix
    }

    pub fn get(&self, ix: ConverterIx) -> &Converter {
        &self.nodes[ix.0]
    }

    pub fn get_mut(&mut self, ix: ConverterIx) -> &mut Converter {
        &mut self.nodes[ix.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ======================================================================
    // Queueing
    // ======================================================================

    /// Append a slot to `parent`'s positional buffer.
    ///
    /// A string (or literal value) justifies the whole chain: the parent
    /// is unqueued. A child converter instead inherits the pending state,
    /// so that *it* can notify the parent later.
    pub fn append_converter(&mut self, parent: ConverterIx, slot: Slot) {
        match slot {
            Slot::Converter(child) => {
                self.get_mut(parent).args.push(slot);
                self.get_mut(child).parent = Some(parent);
                if self.get(parent).queued.is_some() {
                    self.get_mut(child).queued = Some(parent);
                }
            }
            _ => {
                self.get_mut(parent).args.push(slot);
                self.unqueue(parent);
            }
        }
    }

    /// Park a discretionary child in `parent`'s queue.
    pub fn queue_converter(&mut self, parent: ConverterIx, child: ConverterIx) {
        self.get_mut(child).parent = Some(parent);
        self.get_mut(child).queued = Some(parent);
        self.get_mut(parent).args_queue.push_back(child);
    }

    /// Justify `ix`: unqueue it from its parent, recursively up to the
    /// root of the discretionary subtree.
    pub fn unqueue(&mut self, ix: ConverterIx) {
        self.unqueue_through(ix, None);
    }

    fn unqueue_through(&mut self, ix: ConverterIx, through: Option<ConverterIx>) {
        if let Some(parent) = self.get(ix).queued {
            self.unqueue_through(parent, Some(ix));
            self.get_mut(ix).queued = None;
        }

        let Some(target) = through else {
            return;
        };
        // flush the queue from the front up to (and including) the
        // target, preserving positional order
        if !self.get(ix).args_queue.contains(&target) {
            return;
        }
        while let Some(child) = self.get_mut(ix).args_queue.pop_front() {
            self.get_mut(ix).args.push(Slot::Converter(child));
            self.get_mut(child).queued = None;
            if child == target {
                break;
            }
        }
    }

    /// Assign a keyword slot, unqueueing the owner.
    ///
    /// Reassignment is allowed only when it is the same multi-option
    /// converter being re-invoked; anything else is the user repeating a
    /// single-use option.
    pub fn set_kwarg(
        &mut self,
        owner: ConverterIx,
        name: &str,
        slot: Slot,
        option_name: &str,
    ) -> Result<(), UsageError> {
        if let Some(existing) = self.get(owner).kwarg(name) {
            let same_multi = matches!(
                (existing, &slot),
                (Slot::Converter(a), Slot::Converter(b))
                    if a == b && self.get(*a).class.is_multi()
            );
            if same_multi {
                return Ok(());
            }
            return Err(UsageError::OptionRepeated {
                option: option_name.to_string(),
            });
        }
        self.unqueue(owner);
        if let Slot::Converter(child) = &slot {
            self.get_mut(*child).parent = Some(owner);
        }
        self.get_mut(owner).kwargs.push((name.to_string(), slot));
        Ok(())
    }

    /// Do `a` and `b` share a subtree — is one an ancestor of (or equal
    /// to) the other?
    pub fn related(&self, a: ConverterIx, b: ConverterIx) -> bool {
        self.is_ancestor_or_self(a, b) || self.is_ancestor_or_self(b, a)
    }

    fn is_ancestor_or_self(&self, ancestor: ConverterIx, mut node: ConverterIx) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.get(node).parent {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Bank the current invocation buffers of a multi-option.
    pub fn flush_multioption(&mut self, ix: ConverterIx) -> Result<(), InternalError> {
        let node = self.get_mut(ix);
        if !node.class.is_multi() {
            return Err(InternalError::new(format!(
                "flush_multioption on non-multioption converter {:?}",
                node.name
            )));
        }
        let args = std::mem::take(&mut node.args);
        let kwargs = std::mem::take(&mut node.kwargs);
        node.multi_invocations.push((args, kwargs));
        Ok(())
    }

    // ======================================================================
    // Evaluation
    // ======================================================================

    /// The conversion pass: coerce leaf strings and build each
    /// converter's argument values, depth-first. Child converters are
    /// executed as their parent's values are built, so by the time a
    /// callable runs, everything below it has already run.
    pub fn convert(
        &mut self,
        ix: ConverterIx,
        registry: &CallableRegistry,
    ) -> Result<(), UsageError> {
        match self.get(ix).class.clone() {
            ConverterClass::Simple(kind) => self.convert_simple(ix, kind),
            ConverterClass::Flag => {
                let default = self.get(ix).param.default.clone().unwrap_or_default();
                self.get_mut(ix).value = Some(Value::Bool(!default.is_truthy()));
                Ok(())
            }
            ConverterClass::Multi(_) => {
                self.flush_multioption(ix)
                    .map_err(|e| UsageError::Other(e.to_string()))?;
                let invocations = self.get(ix).multi_invocations.clone();
                let mut prepared = Vec::with_capacity(invocations.len());
                for (args, kwargs) in invocations {
                    prepared.push(self.convert_buffers(&args, &kwargs, registry)?);
                }
                self.get_mut(ix).prepared_multi = prepared;
                Ok(())
            }
            ConverterClass::Single(_) | ConverterClass::Sequence(_) => {
                let args = self.get(ix).args.clone();
                let kwargs = self.get(ix).kwargs.clone();
                let call = self.convert_buffers(&args, &kwargs, registry)?;
                let node = self.get_mut(ix);
                node.prepared_args = call.args;
                node.prepared_kwargs = call.kwargs.into_iter().collect();
                Ok(())
            }
        }
    }

    /// Convert one set of buffers: recursively convert child converters,
    /// then execute them in order to produce values.
    fn convert_buffers(
        &mut self,
        args: &[Slot],
        kwargs: &[(String, Slot)],
        registry: &CallableRegistry,
    ) -> Result<CallArgs, UsageError> {
        for slot in args.iter().chain(kwargs.iter().map(|(_, s)| s)) {
            if let Slot::Converter(child) = slot {
                self.convert(*child, registry)?;
            }
        }

        let mut values = Vec::with_capacity(args.len());
        for slot in args {
            values.push(self.slot_value(slot, registry)?);
        }
        let mut kw = FxHashMap::default();
        for (name, slot) in kwargs {
            kw.insert(name.clone(), self.slot_value(slot, registry)?);
        }
        Ok(CallArgs::new(values, kw))
    }

    fn slot_value(
        &mut self,
        slot: &Slot,
        registry: &CallableRegistry,
    ) -> Result<Value, UsageError> {
        match slot {
            Slot::Str(s) => Ok(Value::Str(s.clone())),
            Slot::Value(v) => Ok(v.clone()),
            Slot::Converter(child) => self.execute(*child, registry),
        }
    }

    fn convert_simple(&mut self, ix: ConverterIx, kind: ScalarKind) -> Result<(), UsageError> {
        let node = self.get(ix);
        let name = node.param.name.clone();
        let slots: Vec<Slot> = node
            .args
            .iter()
            .chain(node.kwargs.iter().map(|(_, s)| s))
            .cloned()
            .collect();

        let value = match slots.as_slice() {
            [] => match self.get(ix).param.default.clone() {
                Some(default) => default,
                None => {
                    return Err(UsageError::other(format!(
                        "no argument supplied for {name}"
                    )));
                }
            },
            [slot] => match slot {
                Slot::Str(s) => kind.convert(s, &name)?,
                Slot::Value(Value::Str(s)) => kind.convert(s, &name)?,
                Slot::Value(v) => v.clone(),
                Slot::Converter(_) => {
                    return Err(UsageError::other(format!(
                        "scalar converter {name} received a converter argument"
                    )));
                }
            },
            _ => {
                return Err(UsageError::other(format!(
                    "scalar converter {name} received more than one argument"
                )));
            }
        };
        self.get_mut(ix).value = Some(value);
        Ok(())
    }

    /// The execution pass: invoke the converter's callable on its
    /// prepared values. Runs at most once per converter.
    pub fn execute(
        &mut self,
        ix: ConverterIx,
        registry: &CallableRegistry,
    ) -> Result<Value, UsageError> {
        if let Some(value) = &self.get(ix).value {
            return Ok(value.clone());
        }
        let value = match self.get(ix).class.clone() {
            // scalars and flags were fully computed by the conversion pass
            ConverterClass::Simple(_) | ConverterClass::Flag => {
                return Err(UsageError::other(format!(
                    "converter {} executed before conversion",
                    self.get(ix).name
                )));
            }
            ConverterClass::Sequence(_) => {
                Value::List(std::mem::take(&mut self.get_mut(ix).prepared_args))
            }
            ConverterClass::Single(id) => {
                let entry = registry
                    .get(id)
                    .map_err(|e| UsageError::Other(e.to_string()))?;
                let node = self.get_mut(ix);
                let args = std::mem::take(&mut node.prepared_args);
                let kwargs: FxHashMap<String, Value> =
                    std::mem::take(&mut node.prepared_kwargs).into_iter().collect();
                match &entry.imp {
                    CallableImpl::Native(f) => f(CallArgs::new(args, kwargs))?,
                    CallableImpl::Multi(_) => {
                        return Err(UsageError::other(format!(
                            "{} is a multi-option but was built as a single converter",
                            entry.name
                        )));
                    }
                }
            }
            ConverterClass::Multi(id) => {
                let entry = registry
                    .get(id)
                    .map_err(|e| UsageError::Other(e.to_string()))?;
                let factory = match &entry.imp {
                    CallableImpl::Multi(f) => f.clone(),
                    CallableImpl::Native(_) => {
                        return Err(UsageError::other(format!(
                            "{} is not a multi-option",
                            entry.name
                        )));
                    }
                };
                let default = self.get(ix).param.default.clone();
                let mut accumulator = factory(default.as_ref());
                for call in std::mem::take(&mut self.get_mut(ix).prepared_multi) {
                    accumulator.invoke(call)?;
                }
                accumulator.render()?
            }
        };
        self.get_mut(ix).value = Some(value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appeal_core::{ParamKind, Signature};
    use std::sync::Arc;

    fn str_param(name: &str) -> ParamSpec {
        ParamSpec::new(name, ParamKind::PositionalOrKeyword)
    }

    #[test]
    fn append_string_unqueues_the_chain() {
        let mut arena = ConverterArena::new();
        let root = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("root"),
            "root".to_string(),
        );
        let mid = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("mid"),
            "mid".to_string(),
        );
        let leaf = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("leaf"),
            "leaf".to_string(),
        );

        arena.queue_converter(root, mid);
        arena.get_mut(leaf).queued = Some(mid);
        arena.get_mut(mid).args_queue.push_back(leaf);

        // a string landing in the leaf justifies the whole chain
        arena.append_converter(leaf, Slot::Str("x".to_string()));

        assert!(arena.get(root).args_queue.is_empty());
        assert_eq!(arena.get(root).args, vec![Slot::Converter(mid)]);
        assert_eq!(arena.get(mid).args, vec![Slot::Converter(leaf)]);
        assert!(arena.get(mid).queued.is_none());
        assert!(arena.get(leaf).queued.is_none());
    }

    #[test]
    fn unqueue_flushes_earlier_siblings_first() {
        let mut arena = ConverterArena::new();
        let root = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("root"),
            "root".to_string(),
        );
        let first = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("first"),
            "first".to_string(),
        );
        let second = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("second"),
            "second".to_string(),
        );
        arena.queue_converter(root, first);
        arena.queue_converter(root, second);

        // justifying the second flushes the first ahead of it
        arena.unqueue(second);
        assert_eq!(
            arena.get(root).args,
            vec![Slot::Converter(first), Slot::Converter(second)]
        );
        assert!(arena.get(root).args_queue.is_empty());
    }

    #[test]
    fn skipped_discretionary_converter_stays_queued() {
        let mut arena = ConverterArena::new();
        let root = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("root"),
            "root".to_string(),
        );
        let child = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("child"),
            "child".to_string(),
        );
        arena.queue_converter(root, child);
        assert!(arena.get(root).args.is_empty());
        assert_eq!(arena.get(root).args_queue.len(), 1);
    }

    #[test]
    fn repeated_single_option_is_a_usage_error() {
        let mut arena = ConverterArena::new();
        let owner = arena.alloc(
            ConverterClass::Simple(ScalarKind::Str),
            str_param("owner"),
            "owner".to_string(),
        );
        arena
            .set_kwarg(owner, "verbose", Slot::Value(Value::Bool(true)), "-v")
            .unwrap();
        let err = arena
            .set_kwarg(owner, "verbose", Slot::Value(Value::Bool(true)), "-v")
            .unwrap_err();
        assert_eq!(
            err,
            UsageError::OptionRepeated {
                option: "-v".to_string()
            }
        );
    }

    #[test]
    fn simple_converter_coerces_or_defaults() {
        let mut arena = ConverterArena::new();
        let registry = CallableRegistry::new();

        let with_arg = arena.alloc(
            ConverterClass::Simple(ScalarKind::Int),
            str_param("n"),
            "int".to_string(),
        );
        arena.append_converter(with_arg, Slot::Str("42".to_string()));
        arena.convert(with_arg, &registry).unwrap();
        assert_eq!(arena.get(with_arg).value, Some(Value::Int(42)));

        let with_default = arena.alloc(
            ConverterClass::Simple(ScalarKind::Int),
            str_param("n").with_default(Value::Int(7)),
            "int".to_string(),
        );
        arena.convert(with_default, &registry).unwrap();
        assert_eq!(arena.get(with_default).value, Some(Value::Int(7)));

        let bad = arena.alloc(
            ConverterClass::Simple(ScalarKind::Int),
            str_param("n"),
            "int".to_string(),
        );
        arena.append_converter(bad, Slot::Str("frog".to_string()));
        assert!(matches!(
            arena.convert(bad, &registry),
            Err(UsageError::InvalidValue { .. })
        ));
    }

    #[test]
    fn single_converter_invokes_the_callable() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "pair",
            Signature::builder().positional("a").positional("b").build(),
            CallableImpl::Native(Arc::new(|call: CallArgs| Ok(Value::List(call.args)))),
        );

        let mut arena = ConverterArena::new();
        let ix = arena.alloc(
            ConverterClass::Single(id),
            str_param("pair"),
            "pair".to_string(),
        );
        arena.append_converter(ix, Slot::Str("x".to_string()));
        arena.append_converter(ix, Slot::Str("y".to_string()));
        arena.convert(ix, &registry).unwrap();
        let value = arena.execute(ix, &registry).unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::str("x"), Value::str("y")])
        );
    }

    #[test]
    fn flag_inverts_its_default() {
        let mut arena = ConverterArena::new();
        let registry = CallableRegistry::new();
        let ix = arena.alloc(
            ConverterClass::Flag,
            ParamSpec::new("verbose", ParamKind::KeywordOnly).with_default(Value::Bool(false)),
            "verbose".to_string(),
        );
        arena.convert(ix, &registry).unwrap();
        assert_eq!(arena.get(ix).value, Some(Value::Bool(true)));
    }
}
