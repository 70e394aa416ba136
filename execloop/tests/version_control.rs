//! Git-backed version control against throwaway repositories.

#![cfg(unix)]

use std::fs;
use std::process::Command;

use execloop::io::git::Git;
use execloop::io::version_control::{
    EnvCredentials, GitVersionControl, NOTES_FILE, VcReason, VcRequest, VersionControl,
};
use execloop::test_support::init_git_repo;

fn request(repo: &std::path::Path) -> VcRequest {
    VcRequest {
        repo_path: repo.to_path_buf(),
        commit_message: "feat: generated artifact".to_string(),
        auto_push: false,
        generate_notes: false,
    }
}

fn no_token() -> GitVersionControl<EnvCredentials> {
    GitVersionControl::new(EnvCredentials::with_lookup(|_| None))
}

#[test]
fn commits_changes_and_reports_no_changes_after() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_git_repo(temp.path()).expect("repo");
    fs::write(temp.path().join("out.py"), "print(1)\n").expect("write");

    let vc = no_token();
    let first = vc.run(&request(temp.path())).expect("run");
    assert!(first.committed);
    assert!(!first.pushed);
    assert!(
        Git::new(temp.path())
            .last_commit_summary()
            .expect("summary")
            .contains("feat: generated artifact")
    );

    let second = vc.run(&request(temp.path())).expect("run again");
    assert!(!second.committed);
    assert_eq!(second.reason, Some(VcReason::NoChanges));
}

#[test]
fn notes_file_is_committed_when_requested() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_git_repo(temp.path()).expect("repo");
    fs::write(temp.path().join("out.sh"), "echo hi\n").expect("write");

    let mut req = request(temp.path());
    req.generate_notes = true;
    let outcome = no_token().run(&req).expect("run");
    assert!(outcome.committed);

    let notes = fs::read_to_string(temp.path().join(NOTES_FILE)).expect("notes");
    assert!(notes.contains("feat: generated artifact"));
    assert!(!Git::new(temp.path()).has_staged_changes().expect("staged"));
}

#[test]
fn push_without_remote_is_reported_not_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_git_repo(temp.path()).expect("repo");
    fs::write(temp.path().join("out.js"), "console.log(1)\n").expect("write");

    let mut req = request(temp.path());
    req.auto_push = true;
    let outcome = no_token().run(&req).expect("run");
    assert!(outcome.committed);
    assert!(!outcome.pushed);
    assert_eq!(outcome.reason, Some(VcReason::NoRemote));
}

#[test]
fn push_to_local_bare_remote_sets_upstream() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    let remote = temp.path().join("remote.git");
    fs::create_dir_all(&repo).expect("mkdir");
    init_git_repo(&repo).expect("repo");
    let status = Command::new("git")
        .args(["init", "-q", "--bare"])
        .arg(&remote)
        .status()
        .expect("bare init");
    assert!(status.success());
    let status = Command::new("git")
        .args(["remote", "add", "origin"])
        .arg(&remote)
        .current_dir(&repo)
        .status()
        .expect("remote add");
    assert!(status.success());
    fs::write(repo.join("out.py"), "print(2)\n").expect("write");

    let mut req = request(&repo);
    req.auto_push = true;
    let outcome = no_token().run(&req).expect("run");
    assert!(outcome.committed);
    assert!(outcome.pushed, "{outcome:?}");
}
