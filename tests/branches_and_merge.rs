//! End-to-end tests for branches, merges, rebase, cherry-pick, and
//! reset.

use tract::{
    ConflictKind, Content, MergeCallOptions, MergeType, Outcome, ResetMode, Tract, TractError,
};

/// Fast-forward: merging a descendant branch moves the pointer without
/// creating a commit.
#[test]
fn fast_forward_merge_moves_pointer() {
    let mut t = Tract::open_in_memory().expect("open");
    t.user("A").expect("commit");
    t.create_branch("feature").expect("branch");
    t.checkout("feature").expect("checkout");
    t.user("B").expect("commit");
    let c = t.user("C").expect("commit");
    t.checkout("main").expect("checkout");

    let Outcome::Applied(result) = t.merge("feature").expect("merge") else {
        panic!("expected applied merge");
    };
    assert_eq!(result.merge_type, MergeType::FastForward);
    assert!(result.committed);
    assert_eq!(result.merge_commit_hash.as_deref(), Some(c.commit_hash.as_str()));
    assert_eq!(t.head().expect("head").as_deref(), Some(c.commit_hash.as_str()));
}

/// no_ff forces a merge commit with both parents recorded.
#[test]
fn no_ff_creates_merge_commit() {
    let mut t = Tract::open_in_memory().expect("open");
    let a = t.user("A").expect("commit");
    t.create_branch("feature").expect("branch");
    t.checkout("feature").expect("checkout");
    let c = t.user("C").expect("commit");
    t.checkout("main").expect("checkout");

    let Outcome::Applied(result) = t
        .merge_with(
            "feature",
            MergeCallOptions {
                no_ff: true,
                ..Default::default()
            },
            None,
        )
        .expect("merge")
    else {
        panic!("expected applied merge");
    };
    assert_eq!(result.merge_type, MergeType::Clean);
    let merge_hash = result.merge_commit_hash.expect("merge commit");
    let parents = t.get_parents(&merge_hash).expect("parents");
    assert_eq!(parents, vec![a.commit_hash, c.commit_hash]);
}

/// Clean merge of divergent branches compiles with branch-blocks
/// ordering: the second parent's commits land just before the merge.
#[test]
fn clean_merge_branch_blocks_ordering() {
    let mut t = Tract::open_in_memory().expect("open");
    t.user("base").expect("commit");
    t.create_branch("side").expect("branch");
    t.user("on main").expect("commit");
    t.checkout("side").expect("checkout");
    t.user("on side").expect("commit");
    t.checkout("main").expect("checkout");

    let Outcome::Applied(result) = t.merge("side").expect("merge") else {
        panic!("expected applied merge");
    };
    assert_eq!(result.merge_type, MergeType::Clean);

    let ctx = t.compile().expect("compile");
    let contents: Vec<&str> = ctx.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents[0], "base");
    assert_eq!(contents[1], "on main");
    assert_eq!(contents[2], "on side");
    // The merge commit itself renders last.
    assert!(contents[3].contains("Merged side into main"));
}

/// Merging an already-merged branch reports nothing to merge.
#[test]
fn nothing_to_merge() {
    let mut t = Tract::open_in_memory().expect("open");
    t.user("A").expect("commit");
    t.create_branch("feature").expect("branch");

    let err = t.merge("feature").unwrap_err();
    assert!(matches!(err, TractError::NothingToMerge(_)));
}

/// Conflicting edits surface as a PendingMerge; resolving and approving
/// creates the merge commit and applies the resolution as an edit.
#[test]
fn conflict_merge_with_resolution() {
    let mut t = Tract::open_in_memory().expect("open");
    let h0 = t.system("casual").expect("system");
    t.create_branch("formal").expect("branch");
    t.checkout("formal").expect("checkout");
    t.edit(&h0.commit_hash, Content::instruction("formal"))
        .expect("edit");
    t.checkout("main").expect("checkout");
    t.edit(&h0.commit_hash, Content::instruction("friendly"))
        .expect("edit");

    let Outcome::Pending(mut pending) = t
        .merge_with(
            "formal",
            MergeCallOptions {
                review: true,
                ..Default::default()
            },
            None,
        )
        .expect("merge")
    else {
        panic!("expected pending merge");
    };
    assert_eq!(pending.conflicts().len(), 1);
    assert_eq!(pending.conflicts()[0].conflict_type, ConflictKind::BothEdit);
    assert_eq!(pending.conflicts()[0].target_hash, h0.commit_hash);

    let invalid = pending.validate();
    assert!(!invalid.passed);

    pending
        .set_resolution(&h0.commit_hash, "precise but approachable")
        .expect("resolve");
    assert!(pending.validate().passed);

    let result = pending.approve(&mut t).expect("approve");
    assert!(result.committed);
    let merge_hash = result.merge_commit_hash.expect("merge commit");
    assert_eq!(t.get_parents(&merge_hash).expect("parents").len(), 2);

    let ctx = t.compile().expect("compile");
    assert_eq!(ctx.messages[0].role, "system");
    assert_eq!(ctx.messages[0].content, "precise but approachable");
}

/// A resolver callback resolves conflicts inline and the merge commits
/// directly.
#[test]
fn resolver_resolves_and_commits() {
    let mut t = Tract::open_in_memory().expect("open");
    let h0 = t.system("casual").expect("system");
    t.create_branch("formal").expect("branch");
    t.checkout("formal").expect("checkout");
    t.edit(&h0.commit_hash, Content::instruction("formal"))
        .expect("edit");
    t.checkout("main").expect("checkout");
    t.edit(&h0.commit_hash, Content::instruction("friendly"))
        .expect("edit");

    let resolver =
        |_conflict: &tract::ConflictInfo| tract::Resolution::resolved("merged tone");
    let Outcome::Applied(result) = t
        .merge_with("formal", MergeCallOptions::default(), Some(&resolver))
        .expect("merge")
    else {
        panic!("expected applied merge");
    };
    assert!(result.committed);
    assert_eq!(
        t.compile().expect("compile").messages[0].content,
        "merged tone"
    );
}

/// Rebase replays exclusive commits onto the target tip with new
/// hashes and preserved content.
#[test]
fn rebase_replays_onto_target() {
    let mut t = Tract::open_in_memory().expect("open");
    t.user("A").expect("commit");
    t.create_branch("feature").expect("branch");
    t.checkout("feature").expect("checkout");
    let b = t.user("B").expect("commit");
    let c = t.user("C").expect("commit");
    t.checkout("main").expect("checkout");
    t.user("D").expect("commit");
    t.checkout("feature").expect("checkout");

    let result = t.rebase("main").expect("rebase");
    assert_eq!(result.original_commits, vec![b.commit_hash.clone(), c.commit_hash]);
    assert_eq!(result.replayed_commits.len(), 2);
    assert!(result.warnings.is_empty());

    let ctx = t.compile().expect("compile");
    let contents: Vec<&str> = ctx.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["A", "D", "B", "C"]);
    // Same content, new lineage.
    assert_eq!(result.replayed_commits[0].content_hash, b.content_hash);
    assert_ne!(result.replayed_commits[0].commit_hash, b.commit_hash);
}

/// Cherry-pick copies content under a new hash and records provenance.
#[test]
fn cherry_pick_imports_content() {
    let mut t = Tract::open_in_memory().expect("open");
    t.user("base").expect("commit");
    t.create_branch("side").expect("branch");
    t.checkout("side").expect("checkout");
    let picked = t.user("pick me").expect("commit");
    t.checkout("main").expect("checkout");

    let result = t.cherry_pick(&picked.commit_hash).expect("cherry-pick");
    assert_eq!(result.original.commit_hash, picked.commit_hash);
    assert_eq!(result.imported.content_hash, picked.content_hash);
    assert_ne!(result.imported.commit_hash, picked.commit_hash);
    assert_eq!(
        result.imported.metadata.as_ref().and_then(|m| m["imported_from"].as_str()),
        Some(picked.commit_hash.as_str())
    );

    let contents: Vec<String> = t
        .compile()
        .expect("compile")
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["base", "pick me"]);
}

/// Reset moves the branch pointer; hard mode demands force.
#[test]
fn reset_soft_and_hard() {
    let mut t = Tract::open_in_memory().expect("open");
    let first = t.user("first").expect("commit");
    t.user("second").expect("commit");

    let err = t
        .reset(&first.commit_hash, ResetMode::Hard, false)
        .unwrap_err();
    assert!(matches!(err, TractError::InvalidArgument(_)));

    t.reset(&first.commit_hash, ResetMode::Soft, false)
        .expect("reset");
    assert_eq!(
        t.head().expect("head").as_deref(),
        Some(first.commit_hash.as_str())
    );
    assert_eq!(t.compile().expect("compile").messages.len(), 1);
}

/// Deleting a branch with unmerged commits requires force; the
/// checked-out branch is never deletable.
#[test]
fn branch_deletion_rules() {
    let mut t = Tract::open_in_memory().expect("open");
    t.user("base").expect("commit");
    t.create_branch("wip").expect("branch");
    t.checkout("wip").expect("checkout");
    t.user("unmerged work").expect("commit");

    let err = t.delete_branch("wip", false).unwrap_err();
    assert!(matches!(err, TractError::InvalidArgument(_)));

    t.checkout("main").expect("checkout");
    let err = t.delete_branch("wip", false).unwrap_err();
    assert!(matches!(err, TractError::UnmergedBranch(_)));
    t.delete_branch("wip", true).expect("force delete");
    assert_eq!(t.list_branches().expect("list"), vec!["main".to_string()]);

    let err = t.delete_branch("gone", false).unwrap_err();
    assert!(matches!(err, TractError::BranchNotFound(_)));
}

/// Branch names are validated; duplicates are rejected.
#[test]
fn branch_creation_rules() {
    let mut t = Tract::open_in_memory().expect("open");
    t.user("base").expect("commit");

    assert!(matches!(
        t.create_branch("../escape").unwrap_err(),
        TractError::InvalidBranchName { .. }
    ));
    t.create_branch("feature/x").expect("branch");
    assert!(matches!(
        t.create_branch("feature/x").unwrap_err(),
        TractError::BranchExists(_)
    ));
}

/// Detached HEAD: checkout at a commit detaches; commits move HEAD but
/// not the branch; checking the branch out again reattaches.
#[test]
fn detached_head_flow() {
    let mut t = Tract::open_in_memory().expect("open");
    let first = t.user("first").expect("commit");
    let second = t.user("second").expect("commit");

    t.checkout(&first.commit_hash[..12]).expect("detach");
    assert!(t.is_detached().expect("state"));
    assert_eq!(t.current_branch().expect("branch"), None);

    t.user("detached work").expect("commit");
    assert_ne!(
        t.head().expect("head").as_deref(),
        Some(second.commit_hash.as_str())
    );

    t.checkout("main").expect("reattach");
    assert!(!t.is_detached().expect("state"));
    assert_eq!(
        t.head().expect("head").as_deref(),
        Some(second.commit_hash.as_str())
    );
}
