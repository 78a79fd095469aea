//! Branch-name validation and protected-branch rules.

use crate::error::Error;

/// Maximum branch name length.
pub const MAX_BRANCH_NAME_LENGTH: usize = 64;

/// Branches that can never be targeted by `delete` without explicit force.
pub const DEFAULT_PROTECTED_BRANCHES: &[&str] =
    &["main", "master", "develop", "production", "staging"];

/// Top-level command words that cannot double as branch names.
const RESERVED_NAMES: &[&str] = &[
    "setup",
    "create",
    "remove",
    "delete",
    "remove-all",
    "delete-all",
    "list",
    "prune",
    "help",
    "start-proxy",
    "stop-proxy",
    "start",
    "stop",
    "volumes",
    "packages",
    "droplet",
    "completion",
    "clean-legacy",
];

/// Validate a branch name against the naming rules.
///
/// Accepts lowercase letters, digits, `-`, `_`, and `/`, length 1..=64.
/// Reserved CLI command words are rejected so the passthrough grammar stays
/// unambiguous.
///
/// # Errors
///
/// Returns [`Error::Validation`] describing the first violated rule.
pub fn validate_branch_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::validation("branch name cannot be empty"));
    }
    if name.len() > MAX_BRANCH_NAME_LENGTH {
        return Err(Error::validation(format!(
            "branch name too long: {} > {MAX_BRANCH_NAME_LENGTH}",
            name.len()
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '/')))
    {
        return Err(Error::validation(format!(
            "branch name '{name}' contains invalid character '{c}' \
             (allowed: lowercase letters, digits, '-', '_', '/')"
        )));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::validation(format!(
            "branch name '{name}' cannot start or end with '/'"
        )));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(Error::validation(format!(
            "branch name '{name}' is a reserved command name"
        )));
    }
    Ok(())
}

/// Returns `true` if `name` is in the protected set.
#[must_use]
pub fn is_protected(name: &str, protected: &[String]) -> bool {
    if protected.is_empty() {
        DEFAULT_PROTECTED_BRANCHES.contains(&name)
    } else {
        protected.iter().any(|p| p == name)
    }
}

/// Refuse deletion of a protected branch unless forced.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the branch is protected and `force` is
/// not set.
pub fn check_deletable(name: &str, protected: &[String], force: bool) -> Result<(), Error> {
    if is_protected(name, protected) && !force {
        return Err(Error::validation(format!(
            "branch '{name}' is protected and cannot be deleted (use --force to override)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_feature_branches() {
        validate_branch_name("feature-auth").unwrap();
        validate_branch_name("bugfix/login_page").unwrap();
        validate_branch_name("v2").unwrap();
    }

    #[test]
    fn rejects_bad_characters_and_lengths() {
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("Feature").is_err());
        assert!(validate_branch_name("feat ure").is_err());
        assert!(validate_branch_name("feat.ure").is_err());
        assert!(validate_branch_name(&"a".repeat(65)).is_err());
        assert!(validate_branch_name("/leading").is_err());
    }

    #[test]
    fn rejects_reserved_command_words() {
        let err = validate_branch_name("setup").unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(validate_branch_name("volumes").is_err());
    }

    #[test]
    fn protected_set_defaults_and_overrides() {
        assert!(is_protected("main", &[]));
        assert!(is_protected("staging", &[]));
        assert!(!is_protected("feature-auth", &[]));

        let custom = vec!["trunk".to_string()];
        assert!(is_protected("trunk", &custom));
        assert!(!is_protected("main", &custom));
    }

    #[test]
    fn protected_branches_need_force() {
        assert!(check_deletable("main", &[], false).is_err());
        assert!(check_deletable("main", &[], true).is_ok());
        assert!(check_deletable("feature-auth", &[], false).is_ok());
    }
}
