//! [`RepositoryClient`] backed by the `git` command line.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use updater_core::{GitAuth, RepositoryRef};

use crate::auth;
use crate::client::{CommitInfo, FileSnapshot, RepositoryClient, WorkingCopy};
use crate::error::{io_err, RepoError};

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// Author and committer used for every commit the updater makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "Image Updater".to_string(),
            email: "image-updater@example.com".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
    identity: GitIdentity,
    /// Parent directory for working copies; the system temp dir when unset.
    clone_root: Option<PathBuf>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(GitIdentity::default())
    }
}

impl GitCli {
    pub fn new(identity: GitIdentity) -> Self {
        Self {
            program: PathBuf::from("git"),
            identity,
            clone_root: None,
        }
    }

    pub fn with_clone_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.clone_root = Some(root.into());
        self
    }

    pub fn identity(&self) -> &GitIdentity {
        &self.identity
    }

    fn command(&self, auth: &GitAuth, cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "echo")
            .env("SSH_ASKPASS", "echo")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        auth::apply(&mut cmd, auth);
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<Output, RepoError> {
        cmd.output().await.map_err(RepoError::Spawn)
    }

    /// Run a git subcommand inside `wc`, failing on a non-zero exit.
    async fn git(&self, wc: &WorkingCopy, args: &[&str]) -> Result<String, RepoError> {
        let mut cmd = self.command(&wc.repository().auth, Some(wc.path()));
        cmd.args(args);
        let output = self.run(cmd).await?;
        if !output.status.success() {
            return Err(RepoError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                message: stderr_of(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn temp_dir(&self) -> Result<tempfile::TempDir, RepoError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("image-updater-");
            b
        };
        match &self.clone_root {
            Some(root) => builder.tempdir_in(root).map_err(|e| io_err(root, e)),
            None => builder
                .tempdir()
                .map_err(|e| io_err(std::env::temp_dir(), e)),
        }
    }
}

#[async_trait]
impl RepositoryClient for GitCli {
    async fn clone_repo(&self, repository: &RepositoryRef) -> Result<WorkingCopy, RepoError> {
        let dir = self.temp_dir()?;

        let mut cmd = self.command(&repository.auth, None);
        cmd.args([
            "clone",
            "--quiet",
            "--depth",
            "1",
            "--single-branch",
            "--branch",
            repository.branch.as_str(),
            "--",
            repository.url.as_str(),
        ])
        .arg(dir.path());

        tracing::debug!(url = %repository.url, branch = %repository.branch, auth = repository.auth.method(), "cloning repository");
        let output = self.run(cmd).await?;
        if !output.status.success() {
            return Err(RepoError::CloneFailed {
                url: repository.url.clone(),
                message: stderr_of(&output),
            });
        }

        Ok(WorkingCopy::new(dir, repository.clone()))
    }

    async fn read_file(&self, wc: &WorkingCopy, path: &Path) -> Result<FileSnapshot, RepoError> {
        let full = wc.path().join(path);
        let content = match tokio::fs::read(&full).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepoError::FileNotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(io_err(full, e)),
        };

        let format = format!("--format=%H{FIELD_SEP}%cI");
        let pathspec = git_path(path);
        let (last_commit, last_commit_at) =
            match self.git(wc, &["log", "-1", &format, "--", &pathspec]).await {
                Ok(out) => {
                    let line = out.trim();
                    let mut fields = line.split(FIELD_SEP);
                    let id = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
                    let at = fields.next().and_then(parse_time);
                    (id, at)
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "no commit metadata for file");
                    (None, None)
                }
            };

        Ok(FileSnapshot {
            path: path.to_path_buf(),
            content,
            last_commit,
            last_commit_at,
        })
    }

    async fn last_modified(
        &self,
        wc: &WorkingCopy,
        path: &Path,
        depth: u32,
    ) -> Result<Option<CommitInfo>, RepoError> {
        let depth = depth.max(1);
        let shallow = self
            .git(wc, &["rev-parse", "--is-shallow-repository"])
            .await?;
        if shallow.trim() == "true" {
            let deepen = format!("--deepen={depth}");
            self.git(wc, &["fetch", "--quiet", &deepen, "origin", wc.branch()])
                .await?;
        }

        let max_count = format!("--max-count={depth}");
        let format = format!("--format={RECORD_SEP}%H{FIELD_SEP}%an{FIELD_SEP}%cI{FIELD_SEP}%s");
        let log = self
            .git(wc, &["log", &max_count, &format, "--name-only", "HEAD"])
            .await?;

        Ok(find_commit_touching(&log, &git_path(path)))
    }

    async fn commit_and_push(
        &self,
        wc: &WorkingCopy,
        path: &Path,
        content: &[u8],
        message: &str,
    ) -> Result<String, RepoError> {
        let full = wc.path().join(path);
        write_atomic(&full, content).await?;

        let pathspec = git_path(path);
        self.git(wc, &["add", "--", &pathspec]).await?;

        let mut cmd = self.command(&wc.repository().auth, Some(wc.path()));
        cmd.args([
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--quiet",
            "-m",
            message,
            "--",
            pathspec.as_str(),
        ])
        .env("GIT_AUTHOR_NAME", &self.identity.name)
        .env("GIT_AUTHOR_EMAIL", &self.identity.email)
        .env("GIT_COMMITTER_NAME", &self.identity.name)
        .env("GIT_COMMITTER_EMAIL", &self.identity.email);
        let output = self.run(cmd).await?;
        if !output.status.success() {
            return Err(RepoError::Git {
                command: "commit".to_string(),
                message: stderr_of(&output),
            });
        }
        let commit = self.git(wc, &["rev-parse", "HEAD"]).await?.trim().to_string();

        let refspec = format!("HEAD:refs/heads/{}", wc.branch());
        let mut cmd = self.command(&wc.repository().auth, Some(wc.path()));
        cmd.args(["push", "--porcelain", "origin", refspec.as_str()]);
        let output = self.run(cmd).await?;
        if !output.status.success() {
            let message = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout).trim(),
                stderr_of(&output)
            )
            .trim()
            .to_string();
            let branch = wc.branch().to_string();
            return Err(if is_non_fast_forward(&message) {
                RepoError::PushConflict { branch, message }
            } else {
                RepoError::PushFailed { branch, message }
            });
        }

        tracing::info!(branch = %wc.branch(), commit = %commit, path = %path.display(), "pushed manifest update");
        Ok(commit)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Repository-relative path with forward slashes, as git prints it.
fn git_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Rejections git reports when the remote tip is not an ancestor of ours.
fn is_non_fast_forward(message: &str) -> bool {
    const MARKERS: [&str; 5] = [
        "non-fast-forward",
        "[rejected]",
        "fetch first",
        "stale info",
        "cannot lock ref",
    ];
    MARKERS.iter().any(|m| message.contains(m))
}

/// Parse `git log --name-only` output produced with the record/field
/// separators and return the newest commit listing `path`.
fn find_commit_touching(log: &str, path: &str) -> Option<CommitInfo> {
    log.split(RECORD_SEP)
        .filter(|record| !record.trim().is_empty())
        .find_map(|record| {
            let mut lines = record.lines();
            let header = lines.next()?;
            if !lines.any(|line| line.trim() == path) {
                return None;
            }
            let mut fields = header.split(FIELD_SEP);
            Some(CommitInfo {
                id: fields.next()?.to_string(),
                author: fields.next()?.to_string(),
                timestamp: parse_time(fields.next()?)?,
                summary: fields.next().unwrap_or_default().to_string(),
            })
        })
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), RepoError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.image-updater.tmp"));
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| io_err(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rejections_are_classified() {
        assert!(is_non_fast_forward(
            "To file:///r.git\n!\tHEAD:refs/heads/main\t[rejected] (fetch first)"
        ));
        assert!(is_non_fast_forward(
            "! [rejected]        HEAD -> main (non-fast-forward)"
        ));
        assert!(!is_non_fast_forward(
            "remote: Permission to acme/deploy.git denied to bot."
        ));
    }

    #[test]
    fn log_parsing_finds_newest_touching_commit() {
        let log = format!(
            "{r}c3{f}Bot{f}2024-10-03T10:00:00+00:00{f}touch other\n\nREADME.md\n\
             {r}c2{f}Alice{f}2024-10-02T10:00:00+00:00{f}bump tag\n\napps/values.yaml\n\
             {r}c1{f}Alice{f}2024-10-01T10:00:00+00:00{f}initial\n\napps/values.yaml\nREADME.md\n",
            r = RECORD_SEP,
            f = FIELD_SEP
        );
        let commit = find_commit_touching(&log, "apps/values.yaml").expect("commit");
        assert_eq!(commit.id, "c2");
        assert_eq!(commit.author, "Alice");
        assert_eq!(commit.summary, "bump tag");
        assert!(find_commit_touching(&log, "missing.yaml").is_none());
    }

    #[test]
    fn git_paths_use_forward_slashes() {
        assert_eq!(git_path(Path::new("apps/web/values.yaml")), "apps/web/values.yaml");
    }
}
