//! Working-tree state machine tests against real scratch repositories

mod common;

use std::fs;

use branchmark::error::Error;
use branchmark::git::GitRepo;
use common::{init_repo, sh, sh_output};

#[test]
fn detects_the_checked_out_branch() {
    let repo = init_repo();
    let git = GitRepo::new(repo.path(), None).expect("open repo");
    assert_eq!(git.current_branch(), "main");
}

#[test]
fn checkout_switches_the_working_tree() {
    let repo = init_repo();
    let git = GitRepo::new(repo.path(), None).expect("open repo");

    git.checkout("feature", false, false).expect("checkout");
    assert_eq!(sh_output(repo.path(), "git rev-parse --abbrev-ref HEAD"), "feature");
}

#[test]
fn checkout_of_a_missing_branch_raises_and_leaves_state_alone() {
    let repo = init_repo();
    let git = GitRepo::new(repo.path(), None).expect("open repo");

    let err = git
        .checkout("no_branch_such_as_this", false, false)
        .expect_err("must fail");
    assert!(matches!(err, Error::NoSuchBranch(_)));
    assert!(!git.stashed());
    assert_eq!(sh_output(repo.path(), "git rev-parse --abbrev-ref HEAD"), "main");
}

#[test]
fn anything_to_stash_sees_unstaged_and_staged_changes() {
    let repo = init_repo();
    let git = GitRepo::new(repo.path(), None).expect("open repo");

    assert!(!git.anything_to_stash().expect("clean tree"));

    fs::write(repo.path().join("file"), "dirty\n").expect("dirty the tree");
    assert!(git.anything_to_stash().expect("unstaged"));

    sh(repo.path(), "git add file");
    assert!(git.anything_to_stash().expect("staged"));
}

#[test]
fn stash_then_pop_restores_the_tree_byte_for_byte() {
    let repo = init_repo();
    let mut git = GitRepo::new(repo.path(), None).expect("open repo");

    fs::write(repo.path().join("file"), "work in progress\n").expect("dirty the tree");

    assert!(git.stash_if_needed().expect("stash"));
    assert!(git.stashed());
    assert_eq!(
        fs::read_to_string(repo.path().join("file")).expect("read"),
        "content\n"
    );

    git.pop().expect("pop");
    assert!(!git.stashed());
    assert_eq!(
        fs::read_to_string(repo.path().join("file")).expect("read"),
        "work in progress\n"
    );
    assert_eq!(sh_output(repo.path(), "git stash list"), "");
}

#[test]
fn stash_if_needed_is_a_noop_on_a_clean_tree() {
    let repo = init_repo();
    let mut git = GitRepo::new(repo.path(), None).expect("open repo");

    assert!(!git.stash_if_needed().expect("clean tree"));
    assert!(!git.stashed());
    assert_eq!(sh_output(repo.path(), "git stash list"), "");
}

#[test]
fn pop_with_nothing_stashed_is_an_error() {
    let repo = init_repo();
    let mut git = GitRepo::new(repo.path(), None).expect("open repo");

    let err = git.pop().expect_err("nothing to pop");
    assert!(matches!(err, Error::StashPop(_)));
}

#[test]
fn no_migrations_directory_means_nothing_to_run_down() {
    let repo = init_repo();
    let git = GitRepo::new(repo.path(), None).expect("open repo");

    let versions = git.migrations_to_run_down("feature").expect("diff");
    assert!(versions.is_empty());
}

#[test]
fn migrations_added_on_this_branch_come_back_newest_first() {
    let repo = init_repo();
    sh(
        repo.path(),
        "mkdir -p db/migrate \
         && echo one > db/migrate/101_create_widgets.rb \
         && echo two > db/migrate/202_add_index.rb \
         && git add . \
         && git commit -qm 'add migrations'",
    );

    let git = GitRepo::new(repo.path(), None).expect("open repo");
    let versions = git.migrations_to_run_down("feature").expect("diff");
    assert_eq!(versions, vec!["202".to_string(), "101".to_string()]);
}

#[test]
fn migration_versions_of_different_widths_order_numerically() {
    let repo = init_repo();
    sh(
        repo.path(),
        "mkdir -p db/migrate \
         && echo one > db/migrate/99_create_widgets.rb \
         && echo two > db/migrate/101_add_index.rb \
         && git add . \
         && git commit -qm 'add migrations'",
    );

    let git = GitRepo::new(repo.path(), None).expect("open repo");
    let versions = git.migrations_to_run_down("feature").expect("diff");
    assert_eq!(versions, vec!["101".to_string(), "99".to_string()]);
}

#[test]
fn migrations_present_on_both_states_are_not_run_down() {
    let repo = init_repo();
    sh(
        repo.path(),
        "mkdir -p db/migrate \
         && echo one > db/migrate/101_create_widgets.rb \
         && git add . \
         && git commit -qm 'add migration' \
         && git branch feature_with_migrations",
    );

    let git = GitRepo::new(repo.path(), None).expect("open repo");
    let versions = git
        .migrations_to_run_down("feature_with_migrations")
        .expect("diff");
    assert!(versions.is_empty());
}

#[test]
fn clean_db_discards_changes_under_the_db_path_only() {
    let repo = init_repo();
    sh(
        repo.path(),
        "mkdir -p db \
         && echo 'schema v1' > db/schema.rb \
         && git add . \
         && git commit -qm 'add schema'",
    );

    fs::write(repo.path().join("db/schema.rb"), "schema v2\n").expect("dirty schema");
    fs::write(repo.path().join("file"), "unrelated change\n").expect("dirty file");

    let git = GitRepo::new(repo.path(), None).expect("open repo");
    git.clean_db().expect("clean db");

    assert_eq!(
        fs::read_to_string(repo.path().join("db/schema.rb")).expect("read"),
        "schema v1\n"
    );
    assert_eq!(
        fs::read_to_string(repo.path().join("file")).expect("read"),
        "unrelated change\n"
    );
}

#[test]
fn bundle_is_skipped_when_the_app_has_no_manifest() {
    let repo = init_repo();
    let git = GitRepo::new(repo.path(), None).expect("open repo");
    git.bundle().expect("nothing to install");
}
