//! Version-control collaborator: stage, commit, notes, push with fallbacks.
//!
//! The [`VersionControl`] trait lets the loop and the tool dispatcher commit
//! without depending on `git` directly; tests use recording fakes.

use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::io::git::{Git, token_push_url};

/// File written (and committed) when notes generation is requested.
pub const NOTES_FILE: &str = "EXECLOOP_VERSION_NOTES.md";

static NEEDS_UPSTREAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"no upstream|set upstream|set-upstream|no tracking information|failed to push some refs")
        .expect("valid upstream regex")
});

/// Inputs for one version-control run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VcRequest {
    pub repo_path: PathBuf,
    pub commit_message: String,
    pub auto_push: bool,
    pub generate_notes: bool,
}

impl VcRequest {
    /// Apply `commitMessage`, `autoPush` and `generateNotes` from tool-call params.
    ///
    /// `repoPath` is ignored: tool calls always target the configured repository.
    pub fn with_params(&self, params: &Map<String, Value>) -> Self {
        let mut request = self.clone();
        if let Some(message) = params.get("commitMessage").and_then(Value::as_str)
            && !message.trim().is_empty()
        {
            request.commit_message = message.to_string();
        }
        if let Some(auto_push) = params.get("autoPush").and_then(Value::as_bool) {
            request.auto_push = auto_push;
        }
        if let Some(generate_notes) = params.get("generateNotes").and_then(Value::as_bool) {
            request.generate_notes = generate_notes;
        }
        request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VcReason {
    NoChanges,
    NoRemote,
    AuthNeeded,
    PushFailed,
}

/// What a version-control run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VcOutcome {
    pub committed: bool,
    pub pushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<VcReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl VcOutcome {
    fn committed(pushed: bool) -> Self {
        Self {
            committed: true,
            pushed,
            reason: None,
            note: None,
        }
    }

    fn with_reason(mut self, reason: VcReason) -> Self {
        self.reason = Some(reason);
        self
    }

    fn with_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }
}

pub trait VersionControl {
    fn run(&self, request: &VcRequest) -> Result<VcOutcome>;
}

/// Source of push tokens. Only the version-control collaborator consults it.
pub trait CredentialStore {
    fn push_token(&self) -> Option<String>;
}

/// Reads `EXECLOOP_GIT_TOKEN`, then `GITHUB_TOKEN`.
pub struct EnvCredentials {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvCredentials {
    pub const VARS: [&'static str; 2] = ["EXECLOOP_GIT_TOKEN", "GITHUB_TOKEN"];

    pub fn from_process_env() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl CredentialStore for EnvCredentials {
    fn push_token(&self) -> Option<String> {
        Self::VARS
            .iter()
            .filter_map(|key| (self.lookup)(key))
            .map(|token| token.trim().to_string())
            .find(|token| !token.is_empty())
    }
}

/// [`VersionControl`] backed by `git` subprocesses.
pub struct GitVersionControl<C> {
    credentials: C,
}

impl<C: CredentialStore> GitVersionControl<C> {
    pub fn new(credentials: C) -> Self {
        Self { credentials }
    }

    fn write_notes(&self, git: &Git, message: &str) -> Result<()> {
        let summary = git.last_commit_summary().unwrap_or_default();
        let notes = format!(
            "# Version Notes\n\nCommit message:\n\n{message}\n\nSummary:\n\n{}\n",
            summary.trim()
        );
        let path = git.workdir().join(NOTES_FILE);
        fs::write(&path, notes).with_context(|| format!("write {}", path.display()))?;
        git.add_path(&path)?;
        git.commit_staged("chore: add version notes")?;
        Ok(())
    }

    fn push(&self, git: &Git) -> Result<VcOutcome> {
        let Some(remote) = git.remote_url("origin")? else {
            return Ok(VcOutcome::committed(false).with_reason(VcReason::NoRemote));
        };

        let first = git.push(&["origin", "HEAD"])?;
        if first.success {
            return Ok(VcOutcome::committed(true));
        }

        let branch = git.current_branch()?;
        if let Some(branch) = &branch
            && NEEDS_UPSTREAM.is_match(&first.stderr.to_lowercase())
        {
            debug!(%branch, "retrying push with --set-upstream");
            if git.push(&["--set-upstream", "origin", branch])?.success {
                return Ok(VcOutcome::committed(true).with_note("set-upstream"));
            }
        }

        let Some(token) = self.credentials.push_token() else {
            warn!(stderr = %first.stderr, "push failed and no token available");
            return Ok(VcOutcome::committed(false).with_reason(VcReason::AuthNeeded));
        };
        let Some(url) = token_push_url(&remote, &token) else {
            warn!("remote is not https or scp-like, cannot push with token");
            return Ok(VcOutcome::committed(false).with_reason(VcReason::PushFailed));
        };
        let refspec = match &branch {
            Some(branch) => format!("HEAD:refs/heads/{branch}"),
            None => "HEAD".to_string(),
        };
        if git.push(&[url.as_str(), refspec.as_str()])?.success {
            return Ok(VcOutcome::committed(true).with_note("pushed-with-token"));
        }
        Ok(VcOutcome::committed(false).with_reason(VcReason::PushFailed))
    }
}

impl<C: CredentialStore> VersionControl for GitVersionControl<C> {
    #[instrument(skip_all, fields(repo = %request.repo_path.display(), auto_push = request.auto_push))]
    fn run(&self, request: &VcRequest) -> Result<VcOutcome> {
        let git = Git::new(&request.repo_path);
        git.add_all()?;
        if !git.commit_staged(&request.commit_message)? {
            info!("nothing to commit");
            return Ok(VcOutcome {
                committed: false,
                pushed: false,
                reason: Some(VcReason::NoChanges),
                note: None,
            });
        }

        if request.generate_notes
            && let Err(err) = self.write_notes(&git, &request.commit_message)
        {
            warn!(err = %format!("{err:#}"), "failed to write version notes");
        }

        if !request.auto_push {
            return Ok(VcOutcome::committed(false));
        }
        self.push(&git)
    }
}
