//! Git operations scoped to one working clone.
//!
//! Every call shells out to the `git` binary with the clone as working
//! directory, interactive credential prompts disabled and stdin closed.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::GitError;

/// Porcelain status of a working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub current: Option<String>,
    pub tracking: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub modified: Vec<String>,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
    pub staged: Vec<String>,
    pub untracked: Vec<String>,
    pub is_clean: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchOutcome {
    pub name: String,
    pub created: bool,
    pub checked_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed { hash: String, branch: Option<String> },
    NothingToCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub remote: String,
    pub branch: String,
    pub set_upstream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    /// Author time, seconds since the Unix epoch.
    pub timestamp: i64,
    pub message: String,
}

const DEFAULT_REMOTE: &str = "origin";

/// Handle on a working clone. Holds only the path; safe to rebuild per request.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shallow, single-branch clone of `remote` at `branch` into `dest`.
    pub async fn clone_into(
        remote: &str,
        branch: &str,
        depth: u32,
        dest: &Path,
    ) -> Result<GitRepo, GitError> {
        check_argument("remote url", remote)?;
        check_argument("branch", branch)?;

        let depth = depth.max(1).to_string();
        let mut cmd = git_command(None);
        cmd.args(["clone", "--depth", &depth, "--single-branch", "--branch", branch, "--"])
            .arg(remote)
            .arg(dest);
        run(cmd, "clone").await?;
        Ok(GitRepo::new(dest))
    }

    /// Cheap liveness check of an existing clone.
    pub async fn probe(&self) -> Result<(), GitError> {
        if !tokio::fs::try_exists(self.root.join(".git"))
            .await
            .unwrap_or(false)
        {
            return Err(GitError::Failed {
                command: "status".to_string(),
                code: 128,
                stderr: format!("{} is not a git repository", self.root.display()),
            });
        }
        self.git(&["status", "--porcelain"]).await.map(|_| ())
    }

    pub async fn set_identity(&self, name: Option<&str>, email: Option<&str>) -> Result<(), GitError> {
        if let Some(name) = name {
            self.git(&["config", "user.name", name]).await?;
        }
        if let Some(email) = email {
            self.git(&["config", "user.email", email]).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusSummary, GitError> {
        let out = self
            .git(&["-c", "core.quotePath=false", "status", "--porcelain=v1", "--branch"])
            .await?;
        Ok(parse_status(&out))
    }

    /// Name of the checked-out branch; `None` on a detached HEAD.
    pub async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let (code, stdout) = self
            .git_code(&["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await?;
        if code != 0 {
            return Ok(None);
        }
        Ok(Some(stdout.trim().to_string()))
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{}", name);
        let (code, _) = self
            .git_code(&["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(code == 0)
    }

    /// Create `name`; an existing branch is reused (and checked out if asked).
    pub async fn create_branch(&self, name: &str, checkout: bool) -> Result<BranchOutcome, GitError> {
        check_argument("branch", name)?;

        if self.branch_exists(name).await? {
            if checkout {
                self.git(&["checkout", name]).await?;
            }
            return Ok(BranchOutcome {
                name: name.to_string(),
                created: false,
                checked_out: checkout,
            });
        }

        if checkout {
            self.git(&["checkout", "-b", name]).await?;
        } else {
            self.git(&["branch", name]).await?;
        }
        Ok(BranchOutcome {
            name: name.to_string(),
            created: true,
            checked_out: checkout,
        })
    }

    pub async fn switch_branch(&self, name: &str) -> Result<(), GitError> {
        check_argument("branch", name)?;
        self.git(&["checkout", name]).await.map(|_| ())
    }

    /// Stage `files` (or everything) and commit; an empty index is not committed.
    pub async fn commit(&self, message: &str, files: &[String]) -> Result<CommitOutcome, GitError> {
        if message.trim().is_empty() {
            return Err(GitError::InvalidArgument("commit message is empty".to_string()));
        }

        let mut add: Vec<&str> = vec!["add", "--"];
        if files.is_empty() {
            add.push(".");
        } else {
            add.extend(files.iter().map(String::as_str));
        }
        self.git(&add).await?;

        let (code, _) = self.git_code(&["diff", "--cached", "--quiet"]).await?;
        if code == 0 {
            return Ok(CommitOutcome::NothingToCommit);
        }

        self.git(&["commit", "-m", message]).await?;
        let hash = self.git(&["rev-parse", "HEAD"]).await?.trim().to_string();
        let branch = self.current_branch().await?;
        Ok(CommitOutcome::Committed { hash, branch })
    }

    /// Push `branch` (default: current) to `remote` (default: origin).
    pub async fn push(
        &self,
        remote: Option<&str>,
        branch: Option<&str>,
        set_upstream: bool,
    ) -> Result<PushOutcome, GitError> {
        let remote = remote.unwrap_or(DEFAULT_REMOTE).to_string();
        check_argument("remote", &remote)?;

        let branch = match branch {
            Some(b) => b.to_string(),
            None => self.current_branch().await?.ok_or_else(|| {
                GitError::InvalidArgument("HEAD is detached; name a branch to push".to_string())
            })?,
        };
        check_argument("branch", &branch)?;

        let mut args = vec!["push"];
        if set_upstream {
            args.push("--set-upstream");
        }
        args.push(&remote);
        args.push(&branch);
        self.git(&args).await?;

        Ok(PushOutcome {
            remote,
            branch,
            set_upstream,
        })
    }

    pub async fn log(&self, limit: usize) -> Result<Vec<LogEntry>, GitError> {
        let limit = limit.max(1).to_string();
        let out = self
            .git(&[
                "log",
                "--no-color",
                "-n",
                &limit,
                "--format=%H%x1f%an%x1f%ae%x1f%at%x1f%s",
            ])
            .await?;
        Ok(parse_log(&out))
    }

    /// Unified diff of the working tree (or the index when `staged`).
    pub async fn diff(&self, path: Option<&str>, staged: bool) -> Result<String, GitError> {
        let mut args = vec!["diff", "--no-color", "--no-ext-diff"];
        if staged {
            args.push("--cached");
        }
        if let Some(path) = path {
            args.push("--");
            args.push(path);
        }
        self.git(&args).await
    }

    /// Hard reset to the parent of HEAD. Discards the last commit and all
    /// uncommitted changes.
    pub async fn rollback(&self) -> Result<String, GitError> {
        self.git(&["reset", "--hard", "HEAD~1"]).await?;
        Ok(self.git(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    async fn git(&self, args: &[&str]) -> Result<String, GitError> {
        let mut cmd = git_command(Some(&self.root));
        cmd.args(args);
        run(cmd, args.first().copied().unwrap_or("git")).await
    }

    async fn git_code(&self, args: &[&str]) -> Result<(i32, String), GitError> {
        let mut cmd = git_command(Some(&self.root));
        cmd.args(args);
        let output = cmd.output().await.map_err(GitError::Spawn)?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}

fn git_command(dir: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    // Paths reach git already confined to the clone; no globs or pathspec magic.
    cmd.env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_LITERAL_PATHSPECS", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn run(mut cmd: Command, label: &str) -> Result<String, GitError> {
    debug!(command = label, "git");
    let output = cmd.output().await.map_err(GitError::Spawn)?;
    if !output.status.success() {
        return Err(GitError::Failed {
            command: label.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Refuse values git would parse as options.
fn check_argument(what: &str, value: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidArgument(format!("{} is empty", what)));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidArgument(format!(
            "{} may not start with '-': {}",
            what, value
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c == '\0') {
        return Err(GitError::InvalidArgument(format!(
            "{} contains whitespace: {}",
            what, value
        )));
    }
    Ok(())
}

pub(crate) fn parse_status(text: &str) -> StatusSummary {
    let mut summary = StatusSummary::default();

    for line in text.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            parse_branch_header(header, &mut summary);
            continue;
        }
        if line.len() < 4 {
            continue;
        }
        let mut codes = line.chars();
        let (x, y) = match (codes.next(), codes.next()) {
            (Some(x), Some(y)) => (x, y),
            _ => continue,
        };
        let raw_path = &line[3..];
        let path = match raw_path.split_once(" -> ") {
            Some((_, to)) => unquote(to),
            None => unquote(raw_path),
        };

        if x == '?' && y == '?' {
            summary.untracked.push(path.clone());
            summary.created.push(path);
            continue;
        }
        if x == '!' {
            continue;
        }
        if x == 'A' {
            summary.created.push(path.clone());
        }
        if x == 'M' || y == 'M' {
            summary.modified.push(path.clone());
        }
        if x == 'D' || y == 'D' {
            summary.deleted.push(path.clone());
        }
        if x == 'R' {
            summary.renamed.push(path.clone());
        }
        if x != ' ' {
            summary.staged.push(path);
        }
    }

    summary.is_clean = summary.modified.is_empty()
        && summary.created.is_empty()
        && summary.deleted.is_empty()
        && summary.renamed.is_empty()
        && summary.staged.is_empty();
    summary
}

fn parse_branch_header(header: &str, summary: &mut StatusSummary) {
    if let Some(branch) = header
        .strip_prefix("No commits yet on ")
        .or_else(|| header.strip_prefix("Initial commit on "))
    {
        summary.current = Some(branch.to_string());
        return;
    }
    if header.starts_with("HEAD (no branch)") {
        return;
    }

    let (refs, counts) = match header.split_once(" [") {
        Some((refs, counts)) => (refs, Some(counts.trim_end_matches(']'))),
        None => (header, None),
    };
    match refs.split_once("...") {
        Some((local, upstream)) => {
            summary.current = Some(local.to_string());
            summary.tracking = Some(upstream.to_string());
        }
        None => summary.current = Some(refs.to_string()),
    }

    for part in counts.into_iter().flat_map(|c| c.split(", ")) {
        if let Some(n) = part.strip_prefix("ahead ") {
            summary.ahead = n.parse().unwrap_or(0);
        } else if let Some(n) = part.strip_prefix("behind ") {
            summary.behind = n.parse().unwrap_or(0);
        }
    }
}

fn parse_log(text: &str) -> Vec<LogEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split('\u{1f}');
            Some(LogEntry {
                hash: fields.next()?.to_string(),
                author_name: fields.next()?.to_string(),
                author_email: fields.next()?.to_string(),
                timestamp: fields.next()?.parse().ok()?,
                message: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
