//! Conservative file-pattern conflict detection.
//!
//! Two IN_DEV tickets must never share an overlapping file pattern. The
//! check over-approximates: false positives only delay admission by a
//! cycle, a false negative would let two dev agents mutate the same paths.

/// Strip leading `./` and any trailing slash, collapsing repeated slashes.
fn normalize(pattern: &str) -> String {
    let trimmed = pattern.trim().trim_start_matches("./").trim_end_matches('/');
    let mut out = String::with_capacity(trimmed.len());
    let mut prev_slash = false;
    for c in trimmed.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

/// Drop a trailing `/*` or `/**` so `pkg/a/*` compares as the directory
/// `pkg/a`.
fn strip_wildcard_suffix(pattern: &str) -> &str {
    pattern
        .strip_suffix("/**")
        .or_else(|| pattern.strip_suffix("/*"))
        .unwrap_or(pattern)
}

fn is_wildcard(component: &str) -> bool {
    component == "*" || component == "**"
}

/// `prefix` is an ancestor of `path` on component boundaries.
fn is_component_prefix(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() || path.is_empty() {
        return false;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// Leading concrete (wildcard-free) directory portion of a pattern, e.g.
/// `src/api/**/*.rs` → `src/api`. Empty when the pattern opens with a
/// wildcard.
fn concrete_prefix(pattern: &str) -> String {
    let mut parts = Vec::new();
    for component in pattern.split('/') {
        if is_wildcard(component) || component.contains('*') {
            break;
        }
        parts.push(component);
    }
    parts.join("/")
}

/// Conservative overlap test between two glob-like path patterns.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }

    // Literal equality after normalisation.
    if a == b {
        return true;
    }

    // Ancestor prefix after stripping a trailing /* or /**.
    let a_base = strip_wildcard_suffix(&a);
    let b_base = strip_wildcard_suffix(&b);
    if is_component_prefix(a_base, b_base) || is_component_prefix(b_base, a_base) {
        return true;
    }

    // Pairwise component walk: equal-length patterns where every position
    // matches (equal, or either side is * / **).
    let a_parts: Vec<&str> = a.split('/').collect();
    let b_parts: Vec<&str> = b.split('/').collect();
    if a_parts.len() == b_parts.len()
        && a_parts
            .iter()
            .zip(&b_parts)
            .all(|(x, y)| x == y || is_wildcard(x) || is_wildcard(y))
    {
        return true;
    }

    // Recursive wildcard: compare the first concrete directories.
    if a.contains("**") || b.contains("**") {
        let a_prefix = concrete_prefix(&a);
        let b_prefix = concrete_prefix(&b);
        if a_prefix.is_empty() || b_prefix.is_empty() {
            // A pattern that opens with ** can reach anywhere.
            return true;
        }
        return is_component_prefix(&a_prefix, &b_prefix)
            || is_component_prefix(&b_prefix, &a_prefix);
    }

    false
}

/// Two tickets conflict when any pattern from one potentially overlaps any
/// pattern from the other.
pub fn tickets_conflict(files_a: &[String], files_b: &[String]) -> bool {
    files_a
        .iter()
        .any(|a| files_b.iter().any(|b| patterns_overlap(a, b)))
}

/// Greedy partition of candidate file sets into groups where no two members
/// conflict. Returns the group index for each candidate, in input order,
/// with groups numbered from 0 in ascending dispatch order.
pub fn parallel_groups(candidates: &[Vec<String>]) -> Vec<usize> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut assignment = Vec::with_capacity(candidates.len());
    for (idx, files) in candidates.iter().enumerate() {
        let slot = groups.iter().position(|members| {
            members
                .iter()
                .all(|&m| !tickets_conflict(files, &candidates[m]))
        });
        let group = match slot {
            Some(g) => g,
            None => {
                groups.push(Vec::new());
                groups.len() - 1
            }
        };
        groups[group].push(idx);
        assignment.push(group);
    }
    assignment
}
