//! Marking policy: decides whether a detail probe marks its window for
//! persistence.
//!
//! Patterns are evaluated in declared order; the first match wins. Literal
//! comparison is case-insensitive unless the pattern opts out. Regex
//! patterns use the `regex` crate restricted to a conservative subset
//! (anchors, character classes, alternation, quantifiers, non-capturing
//! groups); anything outside the subset is rejected when the policy is
//! built, so a bad pattern can never surface mid-trace.

use crate::error::{FabricError, Result};
use regex::RegexBuilder;

/// What a pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternTarget {
    /// The hooked function's symbol name.
    Symbol,
    /// The free-form message attached to the probe.
    Message,
}

/// How the pattern text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Literal,
    Regex,
}

/// One declared pattern, before compilation.
#[derive(Debug, Clone)]
pub struct PatternSpec {
    pub target: PatternTarget,
    pub match_kind: MatchKind,
    pub case_sensitive: bool,
    pub pattern: String,
    /// When set, the probe's module must equal this exactly.
    pub module: Option<String>,
}

impl PatternSpec {
    /// Case-insensitive literal match on the symbol (the common trigger).
    pub fn symbol_literal(pattern: impl Into<String>) -> Self {
        Self {
            target: PatternTarget::Symbol,
            match_kind: MatchKind::Literal,
            case_sensitive: false,
            pattern: pattern.into(),
            module: None,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }
}

/// The inputs a detail event exposes to the policy.
#[derive(Debug, Clone, Copy)]
pub struct Probe<'a> {
    pub symbol: &'a str,
    pub module: &'a str,
    pub message: &'a str,
}

#[derive(Debug)]
enum Matcher {
    /// Stored case-folded when the pattern is case-insensitive.
    Literal(String),
    Regex(regex::Regex),
}

#[derive(Debug)]
struct Compiled {
    target: PatternTarget,
    case_sensitive: bool,
    module: Option<String>,
    matcher: Matcher,
}

/// Ordered, compiled pattern list.
#[derive(Debug)]
pub struct MarkingPolicy {
    patterns: Vec<Compiled>,
    enabled: bool,
}

impl MarkingPolicy {
    /// Compile a pattern list. Fails with [`FabricError::InvalidPattern`]
    /// on the first pattern outside the supported subset.
    pub fn new(specs: Vec<PatternSpec>) -> Result<Self> {
        let mut patterns = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let matcher = match spec.match_kind {
                MatchKind::Literal => {
                    if spec.case_sensitive {
                        Matcher::Literal(spec.pattern)
                    } else {
                        Matcher::Literal(spec.pattern.to_lowercase())
                    }
                }
                MatchKind::Regex => {
                    reject_unsupported_syntax(&spec.pattern)
                        .map_err(|reason| FabricError::InvalidPattern { index, reason })?;
                    let re = RegexBuilder::new(&spec.pattern)
                        .case_insensitive(!spec.case_sensitive)
                        .build()
                        .map_err(|e| FabricError::InvalidPattern {
                            index,
                            reason: e.to_string(),
                        })?;
                    Matcher::Regex(re)
                }
            };
            patterns.push(Compiled {
                target: spec.target,
                case_sensitive: spec.case_sensitive,
                module: spec.module,
                matcher,
            });
        }
        Ok(Self { patterns, enabled: true })
    }

    /// A policy that never marks (detail windows are always discarded).
    pub fn disabled() -> Self {
        Self { patterns: Vec::new(), enabled: false }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.patterns.is_empty()
    }

    /// First-match-wins evaluation.
    pub fn matches(&self, probe: &Probe<'_>) -> bool {
        if !self.enabled {
            return false;
        }
        self.patterns.iter().any(|p| Self::pattern_matches(p, probe))
    }

    fn pattern_matches(p: &Compiled, probe: &Probe<'_>) -> bool {
        if let Some(module) = &p.module {
            if probe.module != module {
                return false;
            }
        }
        let subject = match p.target {
            PatternTarget::Symbol => probe.symbol,
            PatternTarget::Message => probe.message,
        };
        match &p.matcher {
            Matcher::Literal(lit) => {
                if p.case_sensitive {
                    subject == lit
                } else {
                    subject.to_lowercase() == *lit
                }
            }
            Matcher::Regex(re) => re.is_match(subject),
        }
    }
}

/// Scan for constructs outside the supported subset.
///
/// Allowed: anchors (`^`, `$`, `\b`, `\B`), character classes (`[...]` and
/// the `\d \D \w \W \s \S` shorthands), alternation, quantifiers
/// (`* + ? {m,n}`), non-capturing and plain groups, and escaped literals.
/// Rejected: backreferences, `\k`, every `(?...)` form except `(?:`,
/// and the Unicode classes `\p`/`\P`.
fn reject_unsupported_syntax(pattern: &str) -> std::result::Result<(), String> {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let Some(&next) = bytes.get(i + 1) else {
                    return Err("trailing backslash".to_string());
                };
                match next {
                    b'1'..=b'9' => {
                        return Err(format!("backreference \\{} is not supported", next as char))
                    }
                    b'k' => return Err("named backreference \\k is not supported".to_string()),
                    b'p' | b'P' => {
                        return Err("unicode class \\p is not supported".to_string())
                    }
                    _ => i += 2,
                }
            }
            b'(' => {
                if bytes.get(i + 1) == Some(&b'?') && bytes.get(i + 2) != Some(&b':') {
                    return Err("only non-capturing (?: groups are supported".to_string());
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(())
}
