//! Sanitization of model-proposed labels.
//!
//! The model is constrained to the repository's label names by the tool
//! schema, but providers drift: labels come back hallucinated,
//! mis-delimited, or pointing at labels humans reserved for themselves.
//! This pure function is the last line of defense before labels are
//! applied.

use std::collections::HashSet;

use regex::Regex;

use crate::github::Label;

/// Default sentinel phrase in a label description marking it human-only.
pub const DISABLE_SENTINEL: &str = "Only humans may set this";

/// Outcome of sanitizing a raw label list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeOutcome {
    /// Labels safe to apply, in input order
    pub final_labels: Vec<String>,
    /// Every repo label excluded from automatic application, whether or
    /// not the model proposed it
    pub disabled_labels: Vec<String>,
    /// Proposed labels that do not exist in the repository at all;
    /// dropped, and worth a warning upstream
    pub unknown_labels: Vec<String>,
}

/// Filter `raw` against the repository's label set.
///
/// A label is disabled when its description contains `sentinel` or its
/// name matches any exclusion regex. A proposed label missing from the
/// repository entirely is dropped into `unknown_labels` rather than
/// treated as disabled. The result preserves input order and guarantees
/// `final_labels` is a subset of the repository's label names.
#[must_use]
pub fn sanitize(
    raw: &[String],
    repo_labels: &[Label],
    excludes: &[Regex],
    sentinel: &str,
) -> SanitizeOutcome {
    let mut disabled = HashSet::new();
    let mut disabled_labels = Vec::new();
    for label in repo_labels {
        let excluded = label.description.contains(sentinel)
            || excludes.iter().any(|re| re.is_match(&label.name));
        if excluded && disabled.insert(label.name.as_str()) {
            disabled_labels.push(label.name.clone());
        }
    }

    let known: HashSet<&str> = repo_labels.iter().map(|l| l.name.as_str()).collect();

    let mut final_labels = Vec::new();
    let mut unknown_labels = Vec::new();
    for label in raw {
        if !known.contains(label.as_str()) {
            unknown_labels.push(label.clone());
            continue;
        }
        if disabled.contains(label.as_str()) {
            continue;
        }
        final_labels.push(label.clone());
    }

    SanitizeOutcome {
        final_labels,
        disabled_labels,
        unknown_labels,
    }
}
