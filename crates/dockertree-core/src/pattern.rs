//! Shell-style glob matching for bulk branch operations.
//!
//! Supports `*`, `?`, and `[...]` character classes (with leading `!` for
//! negation and `-` ranges). Matching is case-insensitive over branch names.

/// Returns `true` if the pattern contains any glob metacharacter.
#[must_use]
pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Match a single branch name against a glob pattern, case-insensitively.
#[must_use]
pub fn matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    glob_match(&pattern, &name)
}

/// Filter `branches` down to those matching `pattern`, preserving order.
///
/// A pattern without wildcards matches only the exact (case-insensitive)
/// branch name, so bulk operations never pick up collateral entries.
#[must_use]
pub fn matching_branches<'a>(pattern: &str, branches: &'a [String]) -> Vec<&'a str> {
    branches
        .iter()
        .map(String::as_str)
        .filter(|b| matches(pattern, b))
        .collect()
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            // Greedy star: try every split point.
            (0..=text.len()).any(|i| glob_match(&pattern[1..], &text[i..]))
        },
        Some('?') => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        Some('[') => match parse_class(&pattern[1..]) {
            Some((class, rest)) => match text.first() {
                Some(&c) if class.contains(c) => glob_match(rest, &text[1..]),
                _ => false,
            },
            // Unterminated class: treat '[' as a literal.
            None => !text.is_empty() && text[0] == '[' && glob_match(&pattern[1..], &text[1..]),
        },
        Some(&p) => match text.first() {
            Some(&c) if c == p => glob_match(&pattern[1..], &text[1..]),
            _ => false,
        },
    }
}

struct CharClass {
    negated: bool,
    singles: Vec<char>,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn contains(&self, c: char) -> bool {
        let hit = self.singles.contains(&c) || self.ranges.iter().any(|&(lo, hi)| c >= lo && c <= hi);
        hit != self.negated
    }
}

/// Parse a `[...]` body starting after the opening bracket. Returns the class
/// and the remaining pattern after the closing bracket, or `None` when the
/// class is unterminated.
fn parse_class(pattern: &[char]) -> Option<(CharClass, &[char])> {
    let mut i = 0;
    let negated = pattern.first() == Some(&'!');
    if negated {
        i += 1;
    }
    let mut singles = Vec::new();
    let mut ranges = Vec::new();
    let mut first = true;
    while i < pattern.len() {
        let c = pattern[i];
        if c == ']' && !first {
            return Some((
                CharClass {
                    negated,
                    singles,
                    ranges,
                },
                &pattern[i + 1..],
            ));
        }
        first = false;
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            ranges.push((c, pattern[i + 2]));
            i += 3;
        } else {
            singles.push(c);
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_match_without_wildcards() {
        assert!(matches("feature-auth", "feature-auth"));
        assert!(matches("Feature-Auth", "feature-auth"));
        assert!(!matches("feature-auth", "feature-auth2"));
    }

    #[test]
    fn star_matches_any_run() {
        assert!(matches("feature-*", "feature-auth"));
        assert!(matches("feature-*", "feature-"));
        assert!(matches("*-auth", "feature-auth"));
        assert!(!matches("feature-*", "bugfix-auth"));
    }

    #[test]
    fn question_matches_single_char() {
        assert!(matches("v?", "v1"));
        assert!(!matches("v?", "v12"));
    }

    #[test]
    fn classes_and_ranges() {
        assert!(matches("release-[0-9]", "release-3"));
        assert!(!matches("release-[0-9]", "release-x"));
        assert!(matches("hotfix-[!0-9]*", "hotfix-a1"));
    }

    #[test]
    fn matching_is_a_subset_of_input() {
        let branches = vec![
            "feature-auth".to_string(),
            "feature-pay".to_string(),
            "main".to_string(),
        ];
        let matched = matching_branches("feature-*", &branches);
        assert_eq!(matched, vec!["feature-auth", "feature-pay"]);
        for m in matched {
            assert!(branches.iter().any(|b| b == m));
        }
    }

    #[test]
    fn wildcard_detection() {
        assert!(has_wildcard("feature-*"));
        assert!(has_wildcard("v?"));
        assert!(has_wildcard("release-[0-9]"));
        assert!(!has_wildcard("feature-auth"));
    }
}
