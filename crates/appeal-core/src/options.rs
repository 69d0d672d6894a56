//! Option keys, normalization, and parse-semantics flags.

use std::fmt;

use bitflags::bitflags;

use crate::signature::ParamSpec;

/// A normalized option key: one character for a short option, the full
/// (dashless) string for a long option.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionKey {
    Short(char),
    Long(String),
}

impl OptionKey {
    /// Normalize an option spelling. Accepts `-x`, `--xyz`, or the bare
    /// forms `x` / `xyz`; single characters normalize short.
    pub fn normalize(spelling: &str) -> OptionKey {
        let bare = spelling.trim_start_matches('-');
        let mut chars = bare.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => OptionKey::Short(c),
            _ => OptionKey::Long(bare.to_string()),
        }
    }

    /// The default short option for a parameter name: its first character.
    pub fn short_for(parameter_name: &str) -> Option<OptionKey> {
        parameter_name.chars().next().map(OptionKey::Short)
    }

    /// The default long option for a parameter name: the name lowercased,
    /// with underscores turned into dashes. Only derived for names longer
    /// than one character.
    pub fn long_for(parameter_name: &str) -> Option<OptionKey> {
        if parameter_name.chars().count() < 2 {
            return None;
        }
        Some(OptionKey::Long(
            parameter_name.to_lowercase().replace('_', "-"),
        ))
    }

    /// The user-facing spelling: `-x` or `--xyz`.
    pub fn denormalize(&self) -> String {
        match self {
            OptionKey::Short(c) => format!("-{c}"),
            OptionKey::Long(s) => format!("--{s}"),
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.denormalize())
    }
}

/// One alias mapping of an option onto a keyword-only parameter.
///
/// A parameter can carry several alias options, and an option can be one
/// of several aliases; the per-callable `kw_parameters` table groups the
/// entries by parameter name in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionEntry {
    /// Normalized option key.
    pub option: OptionKey,
    /// The parameter this alias fills. Distinct aliases may carry
    /// distinct annotations for the same parameter name.
    pub param: ParamSpec,
}

bitflags! {
    /// The parse-semantics bundle: which oparg spellings are accepted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParseFlags: u8 {
        /// `--long OPARG` and `-s OPARG`.
        const OPTION_SPACE_OPARG = 0x01;
        /// `-s=OPARG`.
        const SHORT_OPTION_EQUALS_OPARG = 0x02;
        /// `-sOPARG`; only honored when `-s` takes exactly one optional
        /// oparg.
        const SHORT_OPTION_CONCATENATED_OPARG = 0x04;
    }
}

impl Default for ParseFlags {
    fn default() -> Self {
        ParseFlags::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_spellings() {
        assert_eq!(OptionKey::normalize("-v"), OptionKey::Short('v'));
        assert_eq!(OptionKey::normalize("v"), OptionKey::Short('v'));
        assert_eq!(
            OptionKey::normalize("--verbose"),
            OptionKey::Long("verbose".to_string())
        );
        assert_eq!(
            OptionKey::normalize("verbose"),
            OptionKey::Long("verbose".to_string())
        );
    }

    #[test]
    fn denormalize_round_trip() {
        assert_eq!(OptionKey::Short('x').denormalize(), "-x");
        assert_eq!(OptionKey::Long("x-ray".to_string()).denormalize(), "--x-ray");
    }

    #[test]
    fn derived_options() {
        assert_eq!(OptionKey::short_for("count"), Some(OptionKey::Short('c')));
        assert_eq!(
            OptionKey::long_for("dry_run"),
            Some(OptionKey::Long("dry-run".to_string()))
        );
        assert_eq!(OptionKey::long_for("v"), None);
    }

    #[test]
    fn derived_long_option_lowercases() {
        assert_eq!(
            OptionKey::long_for("dryRun"),
            Some(OptionKey::Long("dryrun".to_string()))
        );
        assert_eq!(
            OptionKey::long_for("Dry_Run"),
            Some(OptionKey::Long("dry-run".to_string()))
        );
    }

    #[test]
    fn default_flags_allow_everything() {
        let flags = ParseFlags::default();
        assert!(flags.contains(ParseFlags::OPTION_SPACE_OPARG));
        assert!(flags.contains(ParseFlags::SHORT_OPTION_CONCATENATED_OPARG));
    }
}
