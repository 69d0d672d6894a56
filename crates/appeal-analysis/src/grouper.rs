//! Linearization of the analyzed tree into argument groups, and the
//! iterator the compiler and interpreter consume.

use std::collections::VecDeque;

use appeal_core::{CallableRegistry, ConfigError, FactoryRegistry, ParamSpec};

use crate::tree::FnNode;

/// One linearized positional parameter.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    name: String,
    fn_name: String,
    index: usize,
    optionality: u32,
    required: bool,
    leaf: bool,
    var_positional: bool,
}

/// What the grouper iterator yields: a parameter plus everything known
/// about its position in the group structure.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedParameter {
    pub name: String,
    /// Name of the callable this is a parameter of.
    pub fn_name: String,
    /// 0-based index of the parameter in that callable's parameter list.
    pub index: usize,
    pub optionality: u32,
    pub required: bool,
    pub in_required_group: bool,
    pub first_in_group: bool,
    pub last_in_group: bool,
    pub leaf: bool,
    pub var_positional: bool,
}

/// Walk the tree in DFS order, yielding every positional parameter with a
/// breadcrumb path for diagnostics. Parents are yielded before their
/// converter subtrees.
fn linearize_into(
    node: &FnNode,
    breadcrumb: &str,
    out: &mut Vec<(String, Entry)>,
) {
    for (i, p) in node.params.iter().enumerate() {
        let star = if p.var_positional { "*" } else { "" };
        let child_breadcrumb = format!("{breadcrumb}, argument {star}{}", p.name);

        out.push((
            child_breadcrumb.clone(),
            Entry {
                name: p.name.clone(),
                fn_name: node.name.clone(),
                index: i,
                optionality: p.optionality,
                required: p.required,
                leaf: p.leaf,
                var_positional: p.var_positional,
            },
        ));

        if let Some(converter) = &p.converter {
            let converter_breadcrumb =
                format!("{child_breadcrumb}, converter {}()", converter.name);
            linearize_into(converter, &converter_breadcrumb, out);
        }
    }
}

fn partition(
    entries: Vec<(String, Entry)>,
) -> Result<(Vec<Entry>, Vec<Vec<Entry>>), ConfigError> {
    let mut groups: Vec<Vec<Entry>> = Vec::new();
    let mut group: Vec<Entry> = Vec::new();
    let mut last_optionality: Option<u32> = None;
    let mut var_positional_breadcrumb: Option<String> = None;

    for (breadcrumb, entry) in entries {
        if let Some(vp) = &var_positional_breadcrumb {
            // a required parameter past a *args can never get an argument,
            // unless it lives inside the *args subtree itself
            if entry.required && !breadcrumb.starts_with(vp.as_str()) {
                return Err(ConfigError::RequiredAfterVarPositional {
                    name: breadcrumb,
                    var_positional: vp.clone(),
                });
            }
        }

        if last_optionality != Some(entry.optionality) || !entry.required {
            if !group.is_empty() {
                groups.push(std::mem::take(&mut group));
            }
            last_optionality = Some(entry.optionality);
        }

        if entry.var_positional {
            var_positional_breadcrumb = Some(breadcrumb);
        }
        group.push(entry);
    }
    if !group.is_empty() {
        groups.push(group);
    }

    let mut required = Vec::new();
    if let Some(first) = groups.first() {
        let head = &first[0];
        if head.required && head.optionality == 0 {
            required = groups.remove(0);
        }
    }
    Ok((required, groups))
}

/// The analyzer's output: a required prefix group and an ordered list of
/// optional groups.
#[derive(Debug)]
pub struct ParameterGrouper {
    required: Vec<Entry>,
    optional: Vec<Vec<Entry>>,
}

impl ParameterGrouper {
    /// Analyze the tree under one parameter.
    pub fn for_param(
        spec: &ParamSpec,
        registry: &CallableRegistry,
        factories: &FactoryRegistry,
    ) -> Result<Self, ConfigError> {
        let mut root = FnNode::from_param(spec, registry, factories)?;
        root.analyze();

        let mut entries = Vec::new();
        linearize_into(&root, &format!("{}()", root.name), &mut entries);
        let (required, optional) = partition(entries)?;

        log::debug!(
            "grouped {}: {} required, {} optional group(s)",
            root.name,
            required.len(),
            optional.len()
        );
        Ok(Self { required, optional })
    }

    /// Iterate leaf parameters only (the ones that consume arguments).
    pub fn iter(&self) -> GrouperIter<'_> {
        GrouperIter::new(self, true)
    }

    /// Iterate every positional parameter, interior nodes included.
    pub fn iter_all(&self) -> GrouperIter<'_> {
        GrouperIter::new(self, false)
    }
}

/// Iterator over [`GroupedParameter`] records.
pub struct GrouperIter<'a> {
    only_leaves: bool,
    current: VecDeque<&'a Entry>,
    queue: VecDeque<VecDeque<&'a Entry>>,
    in_required_group: bool,
    first: bool,
}

impl<'a> GrouperIter<'a> {
    fn new(grouper: &'a ParameterGrouper, only_leaves: bool) -> Self {
        let mut queue: VecDeque<VecDeque<&'a Entry>> = grouper
            .optional
            .iter()
            .map(|g| g.iter().collect())
            .collect();

        let (current, in_required_group) = if !grouper.required.is_empty() {
            (grouper.required.iter().collect(), true)
        } else if let Some(front) = queue.pop_front() {
            (front, false)
        } else {
            (VecDeque::new(), false)
        };

        Self {
            only_leaves,
            current,
            queue,
            in_required_group,
            first: true,
        }
    }

    /// Are there parameters still to come?
    pub fn has_more(&self) -> bool {
        !self.current.is_empty() || !self.queue.is_empty()
    }
}

impl<'a> Iterator for GrouperIter<'a> {
    type Item = GroupedParameter;

    fn next(&mut self) -> Option<GroupedParameter> {
        loop {
            let (entry, in_required_group) = if let Some(entry) = self.current.pop_front() {
                (entry, self.in_required_group)
            } else if let Some(front) = self.queue.pop_front() {
                self.current = front;
                self.in_required_group = false;
                self.first = true;
                (self.current.pop_front()?, false)
            } else {
                return None;
            };

            if self.only_leaves && !(entry.leaf || entry.var_positional) {
                continue;
            }

            let last_in_group = if self.only_leaves {
                !self.current.iter().any(|e| e.leaf || e.var_positional)
            } else {
                self.current.is_empty()
            };

            let gp = GroupedParameter {
                name: entry.name.clone(),
                fn_name: entry.fn_name.clone(),
                index: entry.index,
                optionality: entry.optionality,
                required: entry.required,
                in_required_group,
                first_in_group: self.first,
                last_in_group,
                leaf: entry.leaf,
                var_positional: entry.var_positional,
            };
            self.first = false;
            return Some(gp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appeal_core::{Annotation, CallableId, CallableImpl, ParamKind, Signature, Value};
    use std::sync::Arc;

    fn noop() -> CallableImpl {
        CallableImpl::Native(Arc::new(|_| Ok(Value::Null)))
    }

    fn grouper_for(registry: &mut CallableRegistry, id: CallableId) -> ParameterGrouper {
        let spec = ParamSpec::new("cmd", ParamKind::PositionalOnly)
            .with_annotation(Annotation::Callable(id));
        ParameterGrouper::for_param(&spec, registry, &FactoryRegistry::with_defaults()).unwrap()
    }

    #[test]
    fn all_required_is_one_group() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder().positional("a").positional("b").build(),
            noop(),
        );
        let grouper = grouper_for(&mut registry, id);
        let params: Vec<_> = grouper.iter().collect();
        assert_eq!(params.len(), 2);
        assert!(params.iter().all(|p| p.in_required_group));
        assert!(params[0].first_in_group);
        assert!(!params[1].first_in_group);
        assert!(params[1].last_in_group);
    }

    #[test]
    fn optional_tail_starts_a_new_group() {
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder()
                .positional("a")
                .positional_with("b", None, Some(Value::str("z")))
                .build(),
            noop(),
        );
        let grouper = grouper_for(&mut registry, id);
        let params: Vec<_> = grouper.iter().collect();
        assert_eq!(params.len(), 2);
        assert!(params[0].in_required_group);
        assert!(!params[1].in_required_group);
        assert!(params[1].first_in_group);
        assert_eq!(params[1].optionality, 1);
    }

    #[test]
    fn nested_converter_leaves_flatten_into_parent_group() {
        // cmd(s, pair:intfloat=(0, 0.0)): the pair subtree is one optional
        // group holding both of its leaves.
        let mut registry = CallableRegistry::new();
        let id = registry.register(
            "cmd",
            Signature::builder()
                .positional("s")
                .positional_with(
                    "pair",
                    None,
                    Some(Value::List(vec![Value::Int(0), Value::Float(0.0)])),
                )
                .build(),
            noop(),
        );
        let grouper = grouper_for(&mut registry, id);
        let leaves: Vec<_> = grouper.iter().collect();
        // s, then the two generated element leaves
        assert_eq!(leaves.len(), 3);
        assert!(leaves[0].in_required_group);
        assert!(!leaves[1].in_required_group);
        assert!(leaves[1].first_in_group);
        assert!(!leaves[2].first_in_group);
        assert!(leaves[2].last_in_group);

        // iter_all additionally yields the interior nodes: "pair" itself
        // plus the two generated int/float element parameters
        let all: Vec<_> = grouper.iter_all().collect();
        assert_eq!(all.len(), 6);
        assert!(all.iter().any(|p| !p.leaf && p.name == "pair"));
    }

    #[test]
    fn required_after_var_positional_is_rejected() {
        let mut registry = CallableRegistry::new();
        let child = registry.register(
            "child",
            Signature::builder().positional("x").build(),
            noop(),
        );
        let id = registry.register(
            "cmd",
            Signature::builder()
                .var_positional("rest", None)
                .positional_with("late", Annotation::Callable(child), None)
                .build(),
            noop(),
        );
        let spec = ParamSpec::new("cmd", ParamKind::PositionalOnly)
            .with_annotation(Annotation::Callable(id));
        let err = ParameterGrouper::for_param(
            &spec,
            &registry,
            &FactoryRegistry::with_defaults(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::RequiredAfterVarPositional { .. }));
    }

    #[test]
    fn var_positional_subtree_may_hold_required_leaves() {
        let mut registry = CallableRegistry::new();
        let pair = registry.register(
            "pair",
            Signature::builder().positional("x").positional("y").build(),
            noop(),
        );
        let id = registry.register(
            "cmd",
            Signature::builder()
                .positional("first")
                .var_positional("rest", Annotation::Callable(pair))
                .build(),
            noop(),
        );
        let grouper = grouper_for(&mut registry, id);
        let leaves: Vec<_> = grouper.iter().collect();
        // first, rest (*args), then pair's two required leaves
        assert_eq!(leaves.len(), 4);
        assert!(leaves[1].var_positional);
    }
}
