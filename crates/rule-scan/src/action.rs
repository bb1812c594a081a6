//! Rule-action dispatch.
//!
//! Applies the action scheme of every rule that matched a chunk. Two
//! schemes coexist:
//!
//! * **Tags** (case-insensitive): `log` and `warn` emit a log entry naming
//!   the rule; `drop` terminates the owning session.
//! * **Identifier prefix**: a rule named `log_*` is non-terminating even
//!   when it carries none of the tags above.
//!
//! A matched rule carrying neither a recognised tag nor the `log_` prefix
//! defaults to drop. At most one drop verdict is returned per call; the
//! session enforces at-most-one drop for its whole lifetime.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::compile::RuleMatch;

/// Outcome of dispatching the matches of one scanned chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    /// Keep relaying.
    Continue,
    /// Terminate the session, attributed to the named rule.
    Drop { rule: String },
}

/// Apply every matched rule's actions and collapse to a verdict.
///
/// The first rule (in match order) that requires termination wins; later
/// drop-tagged matches still have their log/warn tags honoured.
pub fn dispatch(matches: &[RuleMatch<'_>]) -> ScanVerdict {
    let mut verdict = ScanVerdict::Continue;
    let mut seen: HashSet<&str> = HashSet::new();

    for m in matches {
        let rule = m.rule;
        // A rule may match through several patterns; act on it once.
        if !seen.insert(rule.name.as_str()) {
            continue;
        }

        if let Some(sub) = &rule.substitution {
            debug!(
                rule = %rule.name,
                replacement = ?sub,
                "rule carries a sub replacement (parsed, not applied)"
            );
        }

        let mut acted = false;
        if rule.has_tag("log") {
            info!(rule = %rule.name, offsets = ?m.offsets, "rule matched");
            acted = true;
        }
        if rule.has_tag("warn") {
            warn!(rule = %rule.name, offsets = ?m.offsets, "rule matched");
            acted = true;
        }
        if rule.has_tag("drop") {
            acted = true;
            if verdict == ScanVerdict::Continue {
                verdict = ScanVerdict::Drop {
                    rule: rule.name.clone(),
                };
            }
        }

        if !acted {
            if rule.name.starts_with("log_") {
                // Alternate scheme: the identifier prefix alone makes the
                // rule non-terminating.
                info!(rule = %rule.name, offsets = ?m.offsets, "rule matched");
            } else if verdict == ScanVerdict::Continue {
                // No recognised tag and no log_ prefix: terminating.
                verdict = ScanVerdict::Drop {
                    rule: rule.name.clone(),
                };
            }
        }
    }

    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::RuleSet;
    use std::time::SystemTime;

    fn compile(yaml: &str) -> RuleSet {
        RuleSet::compile(yaml, SystemTime::UNIX_EPOCH).expect("test rules should compile")
    }

    #[test]
    fn log_and_warn_tags_do_not_terminate() {
        let set = compile(
            r#"
version: "1.0"
rules:
  - name: "observe"
    tags: [log, warn]
    patterns: ["needle"]
"#,
        );
        let verdict = dispatch(&set.scan(b"a needle b"));
        assert_eq!(verdict, ScanVerdict::Continue);
    }

    #[test]
    fn drop_tag_terminates_with_attribution() {
        let set = compile(
            r#"
version: "1.0"
rules:
  - name: "kill-switch"
    tags: [drop]
    patterns: ["BOOM"]
"#,
        );
        let verdict = dispatch(&set.scan(b"xx BOOM xx"));
        assert_eq!(
            verdict,
            ScanVerdict::Drop {
                rule: "kill-switch".to_string()
            }
        );
    }

    #[test]
    fn drop_tag_is_case_insensitive() {
        let set = compile(
            r#"
version: "1.0"
rules:
  - name: "loud"
    tags: [DROP]
    patterns: ["x"]
"#,
        );
        assert!(matches!(
            dispatch(&set.scan(b"x")),
            ScanVerdict::Drop { .. }
        ));
    }

    #[test]
    fn untagged_matched_rule_defaults_to_drop() {
        let set = compile(
            r#"
version: "1.0"
rules:
  - name: "silent"
    patterns: ["trigger"]
"#,
        );
        assert_eq!(
            dispatch(&set.scan(b"trigger")),
            ScanVerdict::Drop {
                rule: "silent".to_string()
            }
        );
    }

    #[test]
    fn log_prefix_makes_untagged_rule_non_terminating() {
        let set = compile(
            r#"
version: "1.0"
rules:
  - name: "log_only"
    patterns: ["trigger"]
"#,
        );
        assert_eq!(dispatch(&set.scan(b"trigger")), ScanVerdict::Continue);
    }

    #[test]
    fn log_prefix_does_not_override_an_explicit_drop_tag() {
        let set = compile(
            r#"
version: "1.0"
rules:
  - name: "log_but_drop"
    tags: [drop]
    patterns: ["trigger"]
"#,
        );
        assert!(matches!(
            dispatch(&set.scan(b"trigger")),
            ScanVerdict::Drop { .. }
        ));
    }

    #[test]
    fn first_dropping_rule_wins() {
        let set = compile(
            r#"
version: "1.0"
rules:
  - name: "second"
    tags: [drop]
    patterns: ["zz"]
  - name: "first"
    tags: [drop]
    patterns: ["aa"]
"#,
        );
        // "aa" matches earlier in the chunk, so its rule is dispatched first.
        assert_eq!(
            dispatch(&set.scan(b"aa then zz")),
            ScanVerdict::Drop {
                rule: "first".to_string()
            }
        );
    }

    #[test]
    fn no_matches_means_continue() {
        let set = compile(
            r#"
version: "1.0"
rules:
  - name: "anything"
    tags: [drop]
    patterns: ["nope"]
"#,
        );
        assert_eq!(dispatch(&set.scan(b"clean")), ScanVerdict::Continue);
    }
}
