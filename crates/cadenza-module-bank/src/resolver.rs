use crate::cpu::CpuFeatures;
use crate::descriptor::{ModuleId, ModuleRegistry};

/// Bonus granted per shortcut position. Earlier entries in a
/// comma-separated request outrank later ones, and any shortcut match
/// outranks every plain score.
const SHORTCUT_BONUS: i64 = 10_000;

/// Parsed form of the `name` argument to `need`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShortcutRequest {
    /// The caller asked for `"none"`: match nothing.
    RefuseAll,
    Select {
        shortcuts: Vec<String>,
        strict: bool,
    },
}

impl ShortcutRequest {
    /// Parse a module request string. `""` and `"any"` select by score
    /// alone; a comma-separated list names shortcuts in preference
    /// order; a trailing `"none"` forces strict mode and a trailing
    /// `"any"` disables it.
    pub fn parse(name: &str, strict: bool) -> Self {
        let name = name.trim();
        if name.is_empty() || name == "any" {
            return Self::Select {
                shortcuts: Vec::new(),
                strict: false,
            };
        }
        if name == "none" {
            return Self::RefuseAll;
        }
        let mut shortcuts: Vec<String> = name
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        let mut strict = strict;
        match shortcuts.last().map(String::as_str) {
            Some("none") => {
                strict = true;
                shortcuts.pop();
            }
            Some("any") => {
                strict = false;
                shortcuts.pop();
            }
            _ => {}
        }
        if shortcuts.is_empty() {
            return Self::Select {
                shortcuts,
                strict: false,
            };
        }
        Self::Select { shortcuts, strict }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub id: ModuleId,
    pub effective_score: i64,
}

/// Rank the registry's eligible modules for one request.
///
/// Filters by capability, CPU flags, and shortcuts; modules scored at
/// or below zero are only eligible when explicitly named. The result is
/// ordered by effective score descending with registration order as the
/// tie-break, so it is reproducible across runs given the same scan.
pub(crate) fn resolve(
    registry: &ModuleRegistry,
    capability: &str,
    shortcuts: &[String],
    strict: bool,
    cpu: CpuFeatures,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();

    for (id, slot) in registry.iter() {
        if slot.revoked {
            continue;
        }
        let metadata = &slot.descriptor.metadata;
        if metadata.capability != capability {
            continue;
        }
        if !cpu.supports(CpuFeatures::from_bits_lossy(metadata.required_cpu)) {
            continue;
        }

        let mut bonus = 0i64;
        if !shortcuts.is_empty() {
            let matched = shortcuts
                .iter()
                .position(|wanted| metadata.matches_shortcut(wanted));
            match matched {
                Some(pos) => {
                    bonus = (shortcuts.len() - pos) as i64 * SHORTCUT_BONUS;
                }
                None => {
                    if strict || metadata.score <= 0 {
                        continue;
                    }
                }
            }
        } else if metadata.score <= 0 {
            continue;
        }

        candidates.push(Candidate {
            id,
            effective_score: metadata.score as i64 + bonus,
        });
    }

    // stable: equal scores keep registration order
    candidates.sort_by(|a, b| b.effective_score.cmp(&a.effective_score));
    candidates
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cadenza_plugin_sdk::{
        ActivationContext, ActivationError, ModuleActivation, ModuleMetadata, ModuleRegistration,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    struct Noop;

    impl ModuleActivation for Noop {
        fn activate(&self, _ctx: &ActivationContext) -> Result<(), ActivationError> {
            Ok(())
        }
    }

    fn registry_with(mods: &[(&str, &str, i32, &[&str])]) -> ModuleRegistry {
        let mut registry = ModuleRegistry::default();
        for (name, capability, score, shortcuts) in mods {
            registry.register_builtin(ModuleRegistration::new(
                ModuleMetadata::new(*name, name.to_uppercase(), *capability, *score)
                    .with_shortcuts(shortcuts.iter().copied()),
                Arc::new(Noop),
            ));
        }
        registry
    }

    fn names(registry: &ModuleRegistry, candidates: &[Candidate]) -> Vec<String> {
        candidates
            .iter()
            .map(|c| registry.slot(c.id).descriptor.short_name().to_owned())
            .collect()
    }

    #[test]
    fn ranks_by_score_descending_with_registration_order_tie_break() {
        let registry = registry_with(&[
            ("low", "access", 10, &[]),
            ("first", "access", 50, &[]),
            ("second", "access", 50, &[]),
        ]);
        let result = resolve(&registry, "access", &[], false, CpuFeatures::empty());
        assert_eq!(names(&registry, &result), vec!["first", "second", "low"]);
    }

    #[test]
    fn filters_other_capabilities() {
        let registry = registry_with(&[("demuxer", "demux", 50, &[]), ("sink", "aout", 50, &[])]);
        let result = resolve(&registry, "demux", &[], false, CpuFeatures::empty());
        assert_eq!(names(&registry, &result), vec!["demuxer"]);
    }

    #[test]
    fn shortcut_match_outranks_any_score() {
        let registry = registry_with(&[
            ("fancy", "demux", 900, &[]),
            ("mp4", "demux", 10, &["mp4", "mov"]),
        ]);
        let shortcuts = vec!["mov".to_owned()];
        let result = resolve(&registry, "demux", &shortcuts, false, CpuFeatures::empty());
        assert_eq!(names(&registry, &result), vec!["mp4", "fancy"]);
    }

    #[test]
    fn earlier_shortcut_positions_win() {
        let registry = registry_with(&[
            ("b", "demux", 10, &["bbb"]),
            ("a", "demux", 10, &["aaa"]),
        ]);
        let shortcuts = vec!["aaa".to_owned(), "bbb".to_owned()];
        let result = resolve(&registry, "demux", &shortcuts, false, CpuFeatures::empty());
        assert_eq!(names(&registry, &result), vec!["a", "b"]);
    }

    #[test]
    fn strict_mode_drops_unmatched_modules() {
        let registry = registry_with(&[("other", "demux", 500, &[])]);
        let shortcuts = vec!["mp4".to_owned()];
        let result = resolve(&registry, "demux", &shortcuts, true, CpuFeatures::empty());
        assert!(result.is_empty());
    }

    #[test]
    fn zero_scored_modules_need_an_explicit_shortcut() {
        let registry = registry_with(&[("dummy", "aout", 0, &["dummy"])]);
        assert!(resolve(&registry, "aout", &[], false, CpuFeatures::empty()).is_empty());
        let shortcuts = vec!["dummy".to_owned()];
        let result = resolve(&registry, "aout", &shortcuts, false, CpuFeatures::empty());
        assert_eq!(names(&registry, &result), vec!["dummy"]);
    }

    #[test]
    fn cpu_requirements_filter_candidates() {
        let mut registry = ModuleRegistry::default();
        registry.register_builtin(ModuleRegistration::new(
            ModuleMetadata::new("simd", "SIMD filter", "video filter", 100)
                .with_required_cpu(CpuFeatures::AVX2.bits()),
            Arc::new(Noop),
        ));
        assert!(resolve(&registry, "video filter", &[], false, CpuFeatures::SSE2).is_empty());
        let result = resolve(
            &registry,
            "video filter",
            &[],
            false,
            CpuFeatures::AVX2 | CpuFeatures::SSE2,
        );
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn parse_handles_any_none_and_lists() {
        assert_eq!(
            ShortcutRequest::parse("any", true),
            ShortcutRequest::Select {
                shortcuts: vec![],
                strict: false
            }
        );
        assert_eq!(
            ShortcutRequest::parse("", true),
            ShortcutRequest::Select {
                shortcuts: vec![],
                strict: false
            }
        );
        assert_eq!(ShortcutRequest::parse("none", false), ShortcutRequest::RefuseAll);
        assert_eq!(
            ShortcutRequest::parse("mp4,avi,none", false),
            ShortcutRequest::Select {
                shortcuts: vec!["mp4".into(), "avi".into()],
                strict: true
            }
        );
        assert_eq!(
            ShortcutRequest::parse("mp4,any", true),
            ShortcutRequest::Select {
                shortcuts: vec!["mp4".into()],
                strict: false
            }
        );
    }
}
