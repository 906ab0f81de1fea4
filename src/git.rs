use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Result, WreckitError};

/// A single entry from `git status --porcelain` output.
///
/// Note: porcelain v1 format uses ASCII for the two-character status code and
/// space separator, so byte-offset slicing at positions 0..2 and 3.. is safe.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    /// Two-character status code (e.g., "M ", "??", "A ")
    pub status_code: String,
    /// The file path
    pub path: String,
}

/// The git/VCS driver the core consumes. Shells out to the `git` binary
/// (and `gh` for pull requests); every call runs in the configured root.
pub struct Git {
    root: PathBuf,
}

impl Git {
    pub fn new(root: &Path) -> Self {
        Git {
            root: root.to_path_buf(),
        }
    }

    /// Verify that a git repository exists in the root directory.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"]).is_ok()
    }

    /// Parse `git status --porcelain` output into structured entries.
    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        let output = self.run(&["status", "--porcelain"])?;
        let entries = output
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                if line.len() < 3 {
                    // Malformed porcelain output line -- skip
                    None
                } else {
                    Some(StatusEntry {
                        status_code: line[..2].to_string(),
                        path: line[3..].to_string(),
                    })
                }
            })
            .collect();
        Ok(entries)
    }

    /// Working-tree entries whose path starts with the given prefix.
    pub fn status_under(&self, prefix: &str) -> Result<Vec<StatusEntry>> {
        Ok(self
            .status()?
            .into_iter()
            .filter(|e| e.path.starts_with(prefix))
            .collect())
    }

    /// Stage specific file paths for commit. Uses explicit paths only
    /// (never `-A` or `.`).
    pub fn stage_paths(&self, paths: &[&str]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--"];
        args.extend(paths);
        self.run(&args)?;
        Ok(())
    }

    /// Create a commit with the given message. Returns the commit hash.
    pub fn commit(&self, message: &str) -> Result<String> {
        self.run(&["commit", "-m", message])?;
        self.head_sha()
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn current_branch(&self) -> Result<String> {
        Ok(self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{}", name),
        ])
        .is_ok()
    }

    /// All local branch names starting with the given prefix.
    pub fn branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let output = self.run(&[
            "for-each-ref",
            "--format=%(refname:short)",
            "refs/heads",
        ])?;
        Ok(output
            .lines()
            .filter(|b| b.starts_with(prefix))
            .map(|b| b.to_string())
            .collect())
    }

    /// Create a branch from a base and check it out.
    pub fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        self.run(&["checkout", "-b", name, base])?;
        Ok(())
    }

    pub fn checkout(&self, name: &str) -> Result<()> {
        self.run(&["checkout", name])?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        self.run(&["branch", "-D", name])?;
        Ok(())
    }

    /// Stash the working tree under a labelled entry.
    pub fn stash_push(&self, message: &str) -> Result<()> {
        self.run(&["stash", "push", "--include-untracked", "-m", message])?;
        Ok(())
    }

    /// Push a branch to origin, creating the upstream if needed.
    pub fn push(&self, branch: &str) -> Result<()> {
        self.run(&["push", "--set-upstream", "origin", branch])
            .map_err(|e| match e {
                WreckitError::BranchError(msg) => WreckitError::PushError(msg),
                other => other,
            })?;
        Ok(())
    }

    /// Create a pull request via the `gh` CLI and return its number.
    pub fn create_pull_request(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<u64> {
        let output = Command::new("gh")
            .args([
                "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
            ])
            .current_dir(&self.root)
            .output()
            .map_err(|e| WreckitError::PrCreationError(format!("Failed to run gh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WreckitError::PrCreationError(stderr.trim().to_string()));
        }

        // gh prints the PR URL on success; the number is the last path segment
        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout.trim().lines().last().unwrap_or("").trim();
        url.rsplit('/')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| {
                WreckitError::PrCreationError(format!("Could not parse PR number from '{}'", url))
            })
    }

    /// Run a git command and return its stdout as a string.
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| {
                WreckitError::BranchError(format!(
                    "Failed to run git {}: {}",
                    args.first().unwrap_or(&""),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WreckitError::BranchError(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout).map_err(|e| {
            WreckitError::BranchError(format!("git output is not valid UTF-8: {}", e))
        })
    }
}
