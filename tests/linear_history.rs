//! End-to-end tests for linear history: committing, compiling, editing,
//! and priority annotations.

use tract::{Content, Priority, Tract};

/// A three-message conversation compiles to exactly the expected
/// role/content pairs.
#[test]
fn linear_conversation_compiles_in_order() {
    let mut t = Tract::open_in_memory().expect("open");
    t.system("You are helpful.").expect("system");
    t.user("Hi").expect("user");
    t.assistant("Hello").expect("assistant");

    let ctx = t.compile().expect("compile");
    assert_eq!(ctx.commit_count, 3);
    let rendered: Vec<(&str, &str)> = ctx
        .messages
        .iter()
        .map(|m| (m.role.as_str(), m.content.as_str()))
        .collect();
    assert_eq!(
        rendered,
        vec![
            ("system", "You are helpful."),
            ("user", "Hi"),
            ("assistant", "Hello"),
        ]
    );
}

/// Editing a message substitutes its content; edit history lists the
/// target then its edits in chronological order.
#[test]
fn edit_resolution_and_history() {
    let mut t = Tract::open_in_memory().expect("open");
    let v0 = t.user("v0").expect("commit");
    let v1 = t
        .edit(&v0.commit_hash, Content::user("v1"))
        .expect("edit");

    let ctx = t.compile().expect("compile");
    assert_eq!(ctx.messages.len(), 1);
    assert_eq!(ctx.messages[0].role, "user");
    assert_eq!(ctx.messages[0].content, "v1");

    let history = t.edit_history(&v0.commit_hash).expect("history");
    let hashes: Vec<&str> = history.iter().map(|c| c.commit_hash.as_str()).collect();
    assert_eq!(hashes, vec![v0.commit_hash.as_str(), v1.commit_hash.as_str()]);
}

/// SKIP removes the message and reduces the token count.
#[test]
fn skip_annotation_removes_message() {
    let mut t = Tract::open_in_memory().expect("open");
    t.system("You are helpful.").expect("system");
    let noisy = t.user("Hi").expect("user");
    t.assistant("Hello").expect("assistant");

    let before = t.compile().expect("compile");
    t.annotate(&noisy.commit_hash, Priority::Skip).expect("annotate");
    let after = t.compile().expect("compile");

    assert_eq!(after.messages.len(), 2);
    assert_eq!(after.messages[0].role, "system");
    assert_eq!(after.messages[1].role, "assistant");
    assert!(after.token_count < before.token_count);
}

/// Pinned commits always appear; a later PINNED annotation overrides an
/// earlier SKIP.
#[test]
fn priority_latest_wins_in_compile() {
    let mut t = Tract::open_in_memory().expect("open");
    let target = t.user("keep me").expect("user");
    t.annotate(&target.commit_hash, Priority::Skip).expect("annotate");
    assert_eq!(t.compile().expect("compile").messages.len(), 0);

    t.annotate(&target.commit_hash, Priority::Pinned).expect("annotate");
    let ctx = t.compile().expect("compile");
    assert_eq!(ctx.messages.len(), 1);
    assert_eq!(ctx.messages[0].content, "keep me");
}

/// Commit hashes resolve by unique prefix; content round-trips.
#[test]
fn prefix_resolution_and_content() {
    let mut t = Tract::open_in_memory().expect("open");
    let info = t.user("payload text").expect("user");
    let prefix = &info.commit_hash[..8];

    let found = t.get_commit(prefix).expect("resolve");
    assert_eq!(found.commit_hash, info.commit_hash);

    let content = t.get_content(prefix).expect("content");
    assert_eq!(content["content_type"], "dialogue");
    assert_eq!(content["text"], "payload text");

    let err = t.get_commit("ab").unwrap_err();
    assert!(err.to_string().contains("at least 4 hex characters"));
}

/// Time travel: compiling at an earlier commit ignores later history.
#[test]
fn compile_at_commit_truncates() {
    let mut t = Tract::open_in_memory().expect("open");
    let first = t.user("first").expect("user");
    t.user("second").expect("user");

    let ctx = t
        .compile_at_commit(&first.commit_hash)
        .expect("compile");
    assert_eq!(ctx.messages.len(), 1);
    assert_eq!(ctx.messages[0].content, "first");
}

/// Custom registered types commit after registry validation and
/// compile with the fallback role.
#[test]
fn custom_content_type_roundtrip() {
    let mut config = tract::TractConfig::in_memory();
    let mut required = std::collections::HashMap::new();
    required.insert("text".to_string(), "string".to_string());
    config.custom_types.register(
        "citation",
        tract::model::CustomTypeSchema {
            required,
            role: None,
        },
    );
    let mut t = Tract::open(config).expect("open");

    let err = t
        .commit_custom(serde_json::json!({"content_type": "citation"}))
        .unwrap_err();
    assert!(err.to_string().contains("requires field 'text'"));

    t.commit_custom(serde_json::json!({"content_type": "citation", "text": "RFC 9110"}))
        .expect("commit");
    let ctx = t.compile().expect("compile");
    assert_eq!(ctx.messages.len(), 1);
    assert_eq!(ctx.messages[0].role, "assistant");
    assert_eq!(ctx.messages[0].content, "RFC 9110");
}
