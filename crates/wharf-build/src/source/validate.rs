//! Input checks applied before any value reaches a git command line.

use crate::error::{BuildError, BuildResult};

/// Validate that a commit SHA looks reasonable.
pub fn validate_commit_sha(commit: &str) -> BuildResult<()> {
    let reject = |message: &str| {
        Err(BuildError::GitCheckout {
            commit: commit.to_owned(),
            message: message.to_owned(),
        })
    };

    if commit.is_empty() {
        return reject("commit SHA cannot be empty");
    }
    if !commit.chars().all(|c| c.is_ascii_hexdigit()) {
        return reject("commit SHA must be hexadecimal");
    }
    // Short SHAs are fine down to 7 characters.
    if commit.len() < 7 {
        return reject("commit SHA too short (minimum 7 characters)");
    }
    if commit.len() > 40 {
        return reject("commit SHA too long (maximum 40 characters)");
    }

    Ok(())
}

/// Validate a branch name before handing it to git.
///
/// Follows the parts of `git check-ref-format` that matter for safety:
/// no option injection, no traversal and no control characters.
pub fn validate_branch_name(name: &str) -> BuildResult<()> {
    let reject = |reason: &str| {
        Err(BuildError::InvalidBranchName {
            name: name.to_owned(),
            reason: reason.to_owned(),
        })
    };

    if name.is_empty() {
        return reject("empty");
    }
    if name.starts_with('-') {
        return reject("must not start with '-'");
    }
    if name.contains("..") {
        return reject("must not contain '..'");
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return reject("malformed path separators");
    }
    if name.ends_with(".lock") || name.ends_with('.') {
        return reject("invalid suffix");
    }
    if name.contains("@{") {
        return reject("must not contain '@{'");
    }
    if name
        .chars()
        .any(|c| c.is_control() || c == ' ' || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return reject("contains a forbidden character");
    }

    Ok(())
}

/// Sanitise a string for use in a filesystem path.
pub fn sanitise_for_path(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
