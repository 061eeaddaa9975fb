//! Scope pattern matching: single `*` wildcard, fully anchored, case-sensitive.
//!
//! Also implements the delegation "subset rule": pattern `q` is subsumed by
//! pattern `p` iff the regular language `p` describes (`*` → `.*`) is a
//! superset of the language `q` describes.

use regex::Regex;

/// Compile a scope pattern into an anchored regex. `*` expands to `.*`;
/// every other character is taken literally.
fn pattern_regex(pattern: &str) -> Regex {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for ch in pattern.chars() {
        if ch == '*' {
            expr.push_str(".*");
        } else {
            expr.push_str(&regex::escape(&ch.to_string()));
        }
    }
    expr.push('$');
    // Patterns are validated at mandate-issuance time; a compile failure here
    // would mean the stored pattern was never valid, which fail-closed
    // evaluation treats as "does not match" rather than panicking.
    Regex::new(&expr).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

/// Whether `value` matches `pattern` under the single-wildcard grammar.
pub fn matches(pattern: &str, value: &str) -> bool {
    pattern_regex(pattern).is_match(value)
}

/// Whether some pattern in `patterns` matches `value`.
pub fn any_matches(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| matches(p, value))
}

/// A pattern is syntactically valid iff non-empty. `*` is the only special
/// character and is always well-formed wherever it appears.
pub fn is_valid_pattern(pattern: &str) -> bool {
    !pattern.is_empty()
}

/// Whether every pattern in `patterns` is syntactically valid and the list
/// itself is non-empty, per the mandate-issuance invariant.
pub fn is_valid_scope(patterns: &[String]) -> bool {
    !patterns.is_empty() && patterns.iter().all(|p| is_valid_pattern(p))
}

/// Whether the language of `child` is a subset of the language of `parent`.
///
/// Exact for the realistic scope-pattern shapes (no wildcard, or a single
/// leading/trailing/embedded wildcard). For patterns with multiple
/// wildcards this degrades to a sound-but-conservative check: it verifies
/// parent's interior literal segments occur, in order, within child's
/// segments, which can reject some subsumptions that a full automaton
/// containment check would accept. See DESIGN.md for the Open Question
/// this resolves.
pub fn is_subsumed(child: &str, parent: &str) -> bool {
    if child == parent {
        return true;
    }
    if !parent.contains('*') {
        // Parent's language is the single literal string `parent`; only an
        // identical literal child can be a subset of a singleton language.
        return !child.contains('*') && child == parent;
    }
    if !child.contains('*') {
        // Child's language is a single literal string; subsumed iff that
        // string matches parent's pattern.
        return matches(parent, child);
    }

    let p_segs: Vec<&str> = parent.split('*').collect();
    let c_segs: Vec<&str> = child.split('*').collect();

    if !parent.starts_with('*') {
        if child.starts_with('*') {
            return false;
        }
        if !c_segs[0].starts_with(p_segs[0]) {
            return false;
        }
    }

    if !parent.ends_with('*') {
        if child.ends_with('*') {
            return false;
        }
        if !c_segs[c_segs.len() - 1].ends_with(p_segs[p_segs.len() - 1]) {
            return false;
        }
    }

    if p_segs.len() > 2 {
        let interior = &p_segs[1..p_segs.len() - 1];
        let haystack = c_segs.join("\u{0}");
        let mut cursor = 0usize;
        for seg in interior {
            if seg.is_empty() {
                continue;
            }
            match haystack[cursor..].find(seg) {
                Some(pos) => cursor += pos + seg.len(),
                None => return false,
            }
        }
    }

    true
}

/// Whether every pattern in `child_patterns` is subsumed by some pattern in
/// `parent_patterns` — the list-level narrowing rule used by delegation.
pub fn is_narrowing(child_patterns: &[String], parent_patterns: &[String]) -> bool {
    child_patterns
        .iter()
        .all(|child| parent_patterns.iter().any(|parent| is_subsumed(child, parent)))
}
