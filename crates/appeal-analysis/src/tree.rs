//! The analyzed annotation tree and the two optionality passes.

use appeal_core::{
    CallableRegistry, ConfigError, ConverterClass, FactoryRegistry, ParamKind, ParamSpec,
    ScalarKind, converter_signature,
};

/// One positional parameter in the annotation tree.
#[derive(Debug)]
pub struct ParamNode {
    pub name: String,
    pub var_positional: bool,
    /// Locally required at first; the second pass may upgrade optional
    /// parameters whose subtree carries a required descendant.
    pub required: bool,
    /// Depth of optional ancestors (plus one if locally optional). Set by
    /// the first pass; may be lowered by the second.
    pub optionality: u32,
    /// True when this parameter swallows a plain string.
    pub leaf: bool,
    /// The nested converter, for non-leaf parameters.
    pub converter: Option<FnNode>,
}

impl ParamNode {
    fn build(
        spec: &ParamSpec,
        registry: &CallableRegistry,
        factories: &FactoryRegistry,
        owner: &str,
    ) -> Result<Self, ConfigError> {
        let var_positional = spec.kind == ParamKind::VarPositional;
        let class = factories.converter_for(spec, registry, owner)?;
        let leaf = class == ConverterClass::Simple(ScalarKind::Str);
        let converter = if leaf {
            None
        } else {
            Some(FnNode::from_class(&class, spec, registry, factories)?)
        };
        Ok(Self {
            name: spec.name.clone(),
            var_positional,
            required: spec.default.is_none() && !var_positional,
            optionality: 0,
            leaf,
            converter,
        })
    }
}

/// One callable in the annotation tree, holding its positional parameters.
///
/// Keyword-only and `**kwargs` parameters never affect grouping and are
/// not represented here.
#[derive(Debug)]
pub struct FnNode {
    pub name: String,
    pub params: Vec<ParamNode>,
}

impl FnNode {
    /// Build the tree under a parameter whose converter class is already
    /// known.
    pub(crate) fn from_class(
        class: &ConverterClass,
        spec: &ParamSpec,
        registry: &CallableRegistry,
        factories: &FactoryRegistry,
    ) -> Result<Self, ConfigError> {
        let name = match class {
            ConverterClass::Single(id) | ConverterClass::Multi(id) => {
                registry.get(*id)?.name.clone()
            }
            ConverterClass::Simple(kind) => kind.type_name().to_string(),
            _ => spec.name.clone(),
        };
        let signature = converter_signature(class, registry)?;
        let mut params = Vec::new();
        for p in signature.params.iter().filter(|p| p.kind.is_positional()) {
            params.push(ParamNode::build(p, registry, factories, &name)?);
        }
        Ok(Self { name, params })
    }

    /// Build the tree under an arbitrary parameter.
    pub fn from_param(
        spec: &ParamSpec,
        registry: &CallableRegistry,
        factories: &FactoryRegistry,
    ) -> Result<Self, ConfigError> {
        let class = factories.converter_for(spec, registry, &spec.name)?;
        Self::from_class(&class, spec, registry, factories)
    }

    /// Pass 1, downward: optionality accumulates along the path from the
    /// root, growing by one at every locally-optional parameter.
    pub(crate) fn first_pass(&mut self, parent_optionality: u32) {
        for p in &mut self.params {
            p.optionality = parent_optionality + u32::from(!p.required);
            if let Some(converter) = &mut p.converter {
                converter.first_pass(p.optionality);
            }
        }
    }

    /// Pass 2, upward and right-to-left: if a deeper level of the tree
    /// must be satisfied, every ancestor positional parameter feeding into
    /// it must be satisfied too. Returns the lowest required optionality
    /// seen in this subtree.
    pub(crate) fn second_pass(&mut self, parent_optionality: u32, mut lowest_required: u32) -> u32 {
        for p in self.params.iter_mut().rev() {
            if let Some(converter) = &mut p.converter {
                let returned = converter.second_pass(p.optionality, lowest_required);
                if returned == parent_optionality {
                    lowest_required = returned;
                }
            }

            if p.optionality > lowest_required {
                p.optionality = lowest_required;
                p.required = true;
            } else if p.required {
                lowest_required = lowest_required.min(p.optionality);
            }
        }
        lowest_required
    }

    pub(crate) fn analyze(&mut self) {
        self.first_pass(0);
        self.second_pass(0, u32::MAX);
    }
}
