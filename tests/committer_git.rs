//! Patch committer scenarios against real git repositories.
//!
//! Each test builds a throwaway repo, feeds the committer a batch of task
//! results, and asserts on branches, working-tree state, and the summary.

use std::thread;
use std::time::Duration;

use taskfarm::committer::PatchCommitter;
use taskfarm::core::types::{TaskResult, TaskStatus};
use taskfarm::io::config::RecoveryConfig;
use taskfarm::test_support::{TestRepo, new_file_patch, task};

fn success_result(id: &str, patch: &str) -> TaskResult {
    let mut result = TaskResult::not_started(task(id)).finish(TaskStatus::Success, "done");
    result.patch = patch.to_string();
    result
}

/// A diff that rewrites the initial README contents.
fn readme_patch() -> String {
    "diff --git a/README.md b/README.md\n\
     --- a/README.md\n\
     +++ b/README.md\n\
     @@ -1 +1 @@\n\
     -# test repo\n\
     +# improved repo\n"
        .to_string()
}

#[test]
fn successful_patch_creates_branch_and_returns_to_anchor() {
    let repo = TestRepo::new().expect("repo");
    let anchor = repo.head_sha().expect("head");
    let committer = PatchCommitter::new(repo.path(), RecoveryConfig::default()).expect("committer");
    assert_eq!(committer.anchor(), anchor);

    let summary = committer
        .apply_results(&[success_result("a", &new_file_patch("y.txt", "hello"))])
        .expect("apply");

    assert_eq!(summary.total, 1);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 0);

    let record = &summary.records[0];
    let branch = record.branch.as_deref().expect("branch");
    assert!(branch.starts_with("task-a-"));

    // Working tree is back on the starting branch at the anchor, without the
    // patched file.
    let git = repo.git();
    assert_eq!(git.head_sha().expect("head"), anchor);
    assert_eq!(git.current_branch().expect("branch").as_deref(), Some("main"));
    assert!(!repo.file_exists("y.txt"));

    // The branch tip contains exactly the patched file.
    git.checkout_branch(branch).expect("checkout branch");
    assert_eq!(repo.read_file("y.txt").expect("read").trim(), "hello");
    git.checkout_branch("main").expect("back to main");
}

#[test]
fn commit_message_records_task_identity() {
    let repo = TestRepo::new().expect("repo");
    let committer = PatchCommitter::new(repo.path(), RecoveryConfig::default()).expect("committer");
    let summary = committer
        .apply_results(&[success_result("a", &new_file_patch("y.txt", "hello"))])
        .expect("apply");
    let branch = summary.records[0].branch.as_deref().expect("branch");

    let message = std::process::Command::new("git")
        .args(["log", "-1", "--format=%B", branch])
        .current_dir(repo.path())
        .output()
        .expect("git log");
    let message = String::from_utf8_lossy(&message.stdout).to_string();
    assert!(message.starts_with("✓ Task a: a title"));
    assert!(message.contains("Report: done"));
    assert!(message.contains("Status: success"));
}

#[test]
fn empty_patch_is_a_no_op_success_without_branch() {
    let repo = TestRepo::new().expect("repo");
    let committer = PatchCommitter::new(repo.path(), RecoveryConfig::default()).expect("committer");

    let summary = committer
        .apply_results(&[success_result("a", "")])
        .expect("apply");

    assert_eq!(summary.successful, 1);
    let record = &summary.records[0];
    assert!(record.no_op);
    assert!(record.branch.is_none());
    assert_eq!(repo.git().local_branches().expect("branches"), vec!["main"]);
}

#[test]
fn dirty_tree_without_policy_refuses_to_run() {
    let repo = TestRepo::new().expect("repo");
    repo.write_file("README.md", "# dirty\n").expect("write");
    let committer = PatchCommitter::new(repo.path(), RecoveryConfig::default()).expect("committer");

    let err = committer
        .apply_results(&[success_result("a", &new_file_patch("y.txt", "hello"))])
        .unwrap_err();
    assert!(err.to_string().contains("dirty beyond recovery policy"));
    // Nothing happened to the repo.
    assert_eq!(repo.git().local_branches().expect("branches"), vec!["main"]);
    assert_eq!(repo.read_file("README.md").expect("read"), "# dirty\n");
}

#[test]
fn auto_stash_preserves_local_modification_across_the_batch() {
    let repo = TestRepo::new().expect("repo");
    // Unstaged modification on a tracked file X.
    repo.write_file("README.md", "# local work in progress\n")
        .expect("write");

    let policy = RecoveryConfig {
        auto_stash: true,
        ..RecoveryConfig::default()
    };
    let committer = PatchCommitter::new(repo.path(), policy).expect("committer");
    let summary = committer
        .apply_results(&[success_result("a", &new_file_patch("y.txt", "hello"))])
        .expect("apply");

    assert_eq!(summary.successful, 1);
    assert!(summary.records[0].branch.is_some());
    // The local modification came back; the task file did not leak into the
    // working tree.
    assert_eq!(
        repo.read_file("README.md").expect("read"),
        "# local work in progress\n"
    );
    assert!(!repo.file_exists("y.txt"));
}

#[test]
fn auto_commit_lands_dirty_state_on_the_current_branch() {
    let repo = TestRepo::new().expect("repo");
    repo.write_file("notes.txt", "scratch\n").expect("write");

    let policy = RecoveryConfig {
        auto_commit: true,
        ..RecoveryConfig::default()
    };
    let committer = PatchCommitter::new(repo.path(), policy).expect("committer");
    let summary = committer
        .apply_results(&[success_result("a", &new_file_patch("y.txt", "hello"))])
        .expect("apply");

    assert_eq!(summary.successful, 1);
    // The scratch file was committed onto main and is still present.
    assert!(repo.file_exists("notes.txt"));
    assert!(repo.git().status_porcelain().expect("status").is_empty());
}

#[test]
fn backup_branch_points_at_the_anchor() {
    let repo = TestRepo::new().expect("repo");
    let anchor = repo.head_sha().expect("head");
    let policy = RecoveryConfig {
        backup_branch: true,
        ..RecoveryConfig::default()
    };
    let committer = PatchCommitter::new(repo.path(), policy).expect("committer");
    committer.apply_results(&[]).expect("apply");

    let backup = repo
        .git()
        .local_branches()
        .expect("branches")
        .into_iter()
        .find(|b| b.starts_with("taskfarm-backup-"))
        .expect("backup branch");
    let tip = std::process::Command::new("git")
        .args(["rev-parse", &backup])
        .current_dir(repo.path())
        .output()
        .expect("rev-parse");
    assert_eq!(String::from_utf8_lossy(&tip.stdout).trim(), anchor);
}

#[test]
fn unapplicable_patch_fails_that_task_and_spares_the_rest() {
    let repo = TestRepo::new().expect("repo");
    let committer = PatchCommitter::new(repo.path(), RecoveryConfig::default()).expect("committer");

    let bad = "diff --git a/missing.txt b/missing.txt\n\
               --- a/missing.txt\n\
               +++ b/missing.txt\n\
               @@ -1 +1 @@\n\
               -line that is not there\n\
               +replacement\n";
    let summary = committer
        .apply_results(&[
            success_result("bad", bad),
            success_result("good", &new_file_patch("y.txt", "hello")),
        ])
        .expect("apply");

    assert_eq!(summary.total, 2);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);
    let bad_record = &summary.records[0];
    assert!(!bad_record.success);
    assert!(bad_record.error.as_deref().expect("error").contains("apply"));
    assert!(bad_record.branch.is_none());
    assert!(summary.records[1].branch.is_some());
    // No stray task-bad branch is left behind.
    assert!(
        repo.git()
            .local_branches()
            .expect("branches")
            .iter()
            .all(|b| !b.starts_with("task-bad-"))
    );
}

#[test]
fn modifying_patch_rewrites_tracked_file_only_on_the_branch() {
    let repo = TestRepo::new().expect("repo");
    let committer = PatchCommitter::new(repo.path(), RecoveryConfig::default()).expect("committer");
    let summary = committer
        .apply_results(&[success_result("a", &readme_patch())])
        .expect("apply");

    let branch = summary.records[0].branch.as_deref().expect("branch");
    assert_eq!(repo.read_file("README.md").expect("read"), "# test repo\n");
    let git = repo.git();
    git.checkout_branch(branch).expect("checkout");
    assert_eq!(repo.read_file("README.md").expect("read"), "# improved repo\n");
    git.checkout_branch("main").expect("back");
}

#[test]
fn rerunning_a_batch_produces_disjoint_branches() {
    let repo = TestRepo::new().expect("repo");
    let anchor = repo.head_sha().expect("head");
    let committer = PatchCommitter::new(repo.path(), RecoveryConfig::default()).expect("committer");
    let batch = [success_result("a", &new_file_patch("y.txt", "hello"))];

    let first = committer.apply_results(&batch).expect("first run");
    thread::sleep(Duration::from_millis(10));
    let second = committer.apply_results(&batch).expect("second run");

    let first_branch = first.records[0].branch.as_deref().expect("branch");
    let second_branch = second.records[0].branch.as_deref().expect("branch");
    assert_ne!(first_branch, second_branch);
    assert!(repo.git().branch_exists(first_branch).expect("exists"));
    assert!(repo.git().branch_exists(second_branch).expect("exists"));
    assert_eq!(repo.head_sha().expect("head"), anchor);
}

#[test]
fn non_success_results_are_recorded_as_failures() {
    let repo = TestRepo::new().expect("repo");
    let committer = PatchCommitter::new(repo.path(), RecoveryConfig::default()).expect("committer");

    let mut failed = TaskResult::not_started(task("a")).finish(TaskStatus::Failure, "broke");
    failed.patch = new_file_patch("y.txt", "hello");
    let summary = committer.apply_results(&[failed]).expect("apply");

    assert_eq!(summary.failed, 1);
    assert!(summary.records[0].error.is_some());
    assert_eq!(repo.git().local_branches().expect("branches"), vec!["main"]);
}
