//! End-to-end tests for compression (manual and LLM-driven with
//! retention) and garbage collection.

use std::rc::Rc;

use tract::llm::ScriptedClient;
use tract::{
    CompressOptions, GcOptions, Outcome, Priority, RetentionCriteria, Tract, TractError,
};

/// Manual compression: pinned commits survive verbatim, the rest
/// collapse into the supplied summary, and the conversation continues
/// on top.
#[test]
fn manual_compression_preserves_pinned() {
    let mut t = Tract::open_in_memory().expect("open");
    t.system("You are a concise tutor.").expect("system");
    t.user("What are decorators?").expect("user");
    t.assistant("Functions wrapping functions.").expect("assistant");
    t.user("What about generators?").expect("user");
    t.assistant("Lazy iteration with yield.").expect("assistant");

    let before = t.compile().expect("compile");
    assert_eq!(before.messages.len(), 5);

    let Outcome::Applied(result) = t
        .compress(CompressOptions::manual(
            "User learned about decorators and generators.",
        ))
        .expect("compress")
    else {
        panic!("expected applied compression");
    };

    assert_eq!(result.source_commits.len(), 4);
    assert_eq!(result.preserved_commits.len(), 1);
    assert_eq!(result.summary_commits.len(), 1);
    assert!(result.compressed_tokens < result.original_tokens);
    // Sources and preserved sets are disjoint.
    assert!(result
        .source_commits
        .iter()
        .all(|s| !result.preserved_commits.contains(s)));

    let after = t.compile().expect("compile");
    assert_eq!(after.messages.len(), 2);
    assert_eq!(after.messages[0].role, "system");
    assert_eq!(after.messages[0].content, "You are a concise tutor.");
    assert_eq!(
        after.messages[1].content,
        "User learned about decorators and generators."
    );

    // The conversation continues on top of the summary.
    t.user("And closures?").expect("user");
    assert_eq!(t.compile().expect("compile").messages.len(), 3);
}

/// preserve= acts as a temporary pin: the preserved pair passes through
/// without a permanent annotation.
#[test]
fn preserve_is_a_temporary_pin() {
    let mut t = Tract::open_in_memory().expect("open");
    t.system("sys").expect("system");
    t.user("old question").expect("user");
    t.assistant("old answer").expect("assistant");
    let keep_q = t.user("important question").expect("user");
    let keep_a = t.assistant("important answer").expect("assistant");

    let Outcome::Applied(result) = t
        .compress(CompressOptions {
            content: Some("Earlier discussion summarized.".to_string()),
            preserve: vec![keep_q.commit_hash.clone(), keep_a.commit_hash.clone()],
            ..Default::default()
        })
        .expect("compress")
    else {
        panic!("expected applied compression");
    };
    assert_eq!(result.preserved_commits.len(), 3);

    let contents: Vec<String> = t
        .compile()
        .expect("compile")
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(
        contents,
        vec![
            "sys".to_string(),
            "Earlier discussion summarized.".to_string(),
            "important question".to_string(),
            "important answer".to_string(),
        ]
    );
}

/// Manual mode refuses multi-group ranges (a pinned commit in the
/// middle splits the range).
#[test]
fn manual_mode_requires_single_group() {
    let mut t = Tract::open_in_memory().expect("open");
    t.user("before").expect("user");
    let pinned = t.user("pinned middle").expect("user");
    t.annotate(&pinned.commit_hash, Priority::Pinned).expect("annotate");
    t.user("after").expect("user");

    let err = t
        .compress(CompressOptions::manual("one summary"))
        .unwrap_err();
    assert!(err.to_string().contains("exactly one group"));
}

/// LLM compression with IMPORTANT retention: a draft missing the
/// pattern triggers a retry; the second draft passes and lands in the
/// compiled output.
#[test]
fn llm_compression_retention_retry() {
    let mut t = Tract::open_in_memory().expect("open");
    let client = Rc::new(ScriptedClient::replies([
        "A summary that forgot the credential.",
        "A summary that keeps sk-12345 for later use.",
    ]));
    t.set_llm_client(Rc::clone(&client) as Rc<dyn tract::llm::LlmClient>);

    t.system("sys").expect("system");
    let secret = t.user("the API key is sk-12345").expect("user");
    t.annotate_with(
        &secret.commit_hash,
        Priority::Important,
        Some(RetentionCriteria::matching(["sk-12345"])),
        None,
    )
    .expect("annotate");
    t.assistant("stored").expect("assistant");

    let Outcome::Applied(result) = t
        .compress(CompressOptions {
            target_tokens: Some(100),
            ..Default::default()
        })
        .expect("compress")
    else {
        panic!("expected applied compression");
    };

    assert_eq!(client.calls(), 2);
    assert_eq!(result.summary_commits.len(), 1);
    let ctx = t.compile().expect("compile");
    assert!(ctx.messages.iter().any(|m| m.content.contains("sk-12345")));
}

/// Retention that can never be satisfied exhausts the retries.
#[test]
fn retention_retry_exhaustion() {
    let mut t = Tract::open_in_memory().expect("open");
    let client = Rc::new(ScriptedClient::replies([
        "bad draft one",
        "bad draft two",
        "bad draft three",
    ]));
    t.set_llm_client(client as Rc<dyn tract::llm::LlmClient>);

    let secret = t.user("keep THE-TOKEN around").expect("user");
    t.annotate_with(
        &secret.commit_hash,
        Priority::Important,
        Some(RetentionCriteria::matching(["THE-TOKEN"])),
        None,
    )
    .expect("annotate");

    let err = t
        .compress(CompressOptions {
            target_tokens: Some(50),
            ..Default::default()
        })
        .unwrap_err();
    match err {
        TractError::RetryExhausted {
            attempts,
            last_diagnosis,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_diagnosis.contains("THE-TOKEN"));
        }
        other => panic!("expected RetryExhausted, got {other}"),
    }
}

/// GC removes archived sources and orphans once past retention, never
/// touching reachable history; `None` retention keeps everything.
#[test]
fn gc_respects_reachability_and_retention() {
    let mut t = Tract::open_in_memory().expect("open");
    t.system("sys").expect("system");
    t.user("q1").expect("user");
    t.assistant("a1").expect("assistant");
    t.user("q2").expect("user");

    let Outcome::Applied(compressed) = t
        .compress(CompressOptions::manual("Q&A summarized."))
        .expect("compress")
    else {
        panic!("expected applied compression");
    };
    let before = t.compile().expect("compile");

    // Keep-forever retention removes nothing.
    let Outcome::Applied(kept) = t.gc(GcOptions::default()).expect("gc") else {
        panic!("expected applied gc");
    };
    assert_eq!(kept.commits_removed, 0);

    // Zero-day retention removes the archived sources and the orphaned
    // old chain.
    let Outcome::Applied(result) = t
        .gc(GcOptions {
            orphan_retention_days: Some(0.0),
            archive_retention_days: Some(0.0),
        })
        .expect("gc")
    else {
        panic!("expected applied gc");
    };
    assert!(result.commits_removed >= compressed.source_commits.len());
    assert_eq!(result.source_commits_removed, compressed.source_commits.len());
    assert!(result.tokens_freed > 0);

    // Archived sources are gone; reachable history is untouched.
    for source in &compressed.source_commits {
        assert!(t.get_commit(source).is_err());
    }
    assert_eq!(t.compile().expect("compile"), before);

    // A second run finds nothing left.
    let Outcome::Applied(empty) = t
        .gc(GcOptions {
            orphan_retention_days: Some(0.0),
            archive_retention_days: Some(0.0),
        })
        .expect("gc")
    else {
        panic!("expected applied gc");
    };
    assert_eq!(empty.commits_removed, 0);
}
