//! Deterministic naming for worktrees and branches.
//!
//! Every name here is a pure function of its inputs so that a repeated
//! request for the same work item lands on the same path and branch.

use std::path::{Path, PathBuf};

/// Lowercase `input`, collapse every run of characters outside `[a-z0-9]`
/// into a single `-`, and trim dashes from both ends.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Sanitized title capped at `max_len` characters.
pub fn title_slug(title: &str, max_len: usize) -> String {
    let full = sanitize(title);
    if full.len() <= max_len {
        return full;
    }
    // sanitize() only emits ASCII, so byte slicing is char-aligned.
    full.get(..max_len)
        .unwrap_or(&full)
        .trim_end_matches('-')
        .to_string()
}

/// Branch for a work item: `feature/issue-{id}-{slug}`.
pub fn branch_name(work_item: u64, title: &str, max_len: usize) -> String {
    let slug = title_slug(title, max_len);
    if slug.is_empty() {
        format!("feature/issue-{work_item}")
    } else {
        format!("feature/issue-{work_item}-{slug}")
    }
}

/// Slug identifying a repository, derived from its remote URL.
///
/// Handles scp-style (`git@host:owner/repo.git`) and URL-style
/// (`https://host/owner/repo`) remotes; the host is dropped and the
/// remaining path segments are joined with `-`.
pub fn repo_slug_from_remote(remote: &str) -> Option<String> {
    let trimmed = remote.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }

    let path_part = if let Some((_, rest)) = trimmed.split_once("://") {
        // scheme://[user@]host[:port]/path
        rest.split_once('/').map(|(_, p)| p).unwrap_or("")
    } else if let Some((_, rest)) = trimmed.split_once(':') {
        rest
    } else {
        trimmed
    };

    let path_part = path_part.trim_end_matches(".git");
    let slug = path_part
        .split('/')
        .filter(|s| !s.is_empty())
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}

/// Slug from a repository directory's basename.
pub fn repo_slug_from_dir(repo_path: &Path) -> String {
    let base = repo_path
        .file_name()
        .map(|n| sanitize(&n.to_string_lossy()))
        .unwrap_or_default();
    if base.is_empty() {
        "repo".to_string()
    } else {
        base
    }
}

/// Worktree directory: `{root}/{repo_slug}/issue-{id}`.
pub fn worktree_path(root: &Path, repo_slug: &str, work_item: u64) -> PathBuf {
    root.join(repo_slug).join(format!("issue-{work_item}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_runs() {
        assert_eq!(sanitize("Add dark mode"), "add-dark-mode");
        assert_eq!(sanitize("  Fix: bug #42!! "), "fix-bug-42");
        assert_eq!(sanitize("Planning   Mode"), "planning-mode");
        assert_eq!(sanitize("***"), "");
    }

    #[test]
    fn branch_names_follow_issue_convention() {
        assert_eq!(
            branch_name(42, "Add dark mode", 50),
            "feature/issue-42-add-dark-mode"
        );
        assert_eq!(
            branch_name(6, "Planning mode", 50),
            "feature/issue-6-planning-mode"
        );
        assert_eq!(branch_name(7, "!!!", 50), "feature/issue-7");
    }

    #[test]
    fn title_slug_is_capped_without_trailing_dash() {
        let slug = title_slug("aaaa bbbb cccc", 5);
        assert_eq!(slug, "aaaa");
        assert!(title_slug(&"x".repeat(200), 50).len() <= 50);
    }

    #[test]
    fn remote_slugs() {
        assert_eq!(
            repo_slug_from_remote("git@github.com:Acme/Widgets.git").as_deref(),
            Some("acme-widgets")
        );
        assert_eq!(
            repo_slug_from_remote("https://github.com/acme/widgets").as_deref(),
            Some("acme-widgets")
        );
        assert_eq!(
            repo_slug_from_remote("ssh://git@gitlab.example.com:2222/group/sub/proj.git/")
                .as_deref(),
            Some("group-sub-proj")
        );
        assert_eq!(repo_slug_from_remote(""), None);
    }

    #[test]
    fn dir_slug_fallback() {
        assert_eq!(repo_slug_from_dir(Path::new("/src/My Repo")), "my-repo");
        assert_eq!(repo_slug_from_dir(Path::new("/")), "repo");
    }

    #[test]
    fn worktree_path_is_deterministic() {
        let p = worktree_path(Path::new("/wt"), "acme-widgets", 42);
        assert_eq!(p, PathBuf::from("/wt/acme-widgets/issue-42"));
    }
}
