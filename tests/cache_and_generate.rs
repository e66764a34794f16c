//! End-to-end tests for incremental cache equivalence and the
//! generate/chat flow with API token calibration.

use std::rc::Rc;

use tract::llm::{ChatCompletion, LlmClient, ScriptedClient};
use tract::{Content, Priority, TokenUsage, Tract};

/// After a burst of appends, edits, and annotation changes, the
/// incrementally patched compile equals a from-scratch recompile.
#[test]
fn incremental_cache_matches_full_recompile() {
    let mut t = Tract::open_in_memory().expect("open");

    let mut hashes = Vec::new();
    for i in 0..10 {
        hashes.push(t.user(format!("message {i}")).expect("commit").commit_hash);
        // Keep the cache warm so every subsequent write patches it.
        t.compile().expect("compile");
    }

    t.edit(&hashes[2], Content::user("edited two"))
        .expect("edit");
    t.edit(&hashes[5], Content::user("edited five"))
        .expect("edit");
    t.edit(&hashes[2], Content::user("edited two, again"))
        .expect("edit");
    t.annotate(&hashes[7], Priority::Skip).expect("annotate");
    t.annotate(&hashes[1], Priority::Pinned).expect("annotate");

    let incremental = t.compile().expect("compile");
    t.clear_cache();
    let fresh = t.compile().expect("compile");

    assert_eq!(incremental, fresh);
    assert_eq!(incremental.commit_count, 9);
    assert_eq!(incremental.messages[2].content, "edited two, again");
    assert!(!incremental
        .commit_hashes
        .iter()
        .any(|h| h == &hashes[7]));
}

/// Un-skipping a commit forces a recompile that brings the message
/// back.
#[test]
fn unskip_recovers_message() {
    let mut t = Tract::open_in_memory().expect("open");
    let target = t.user("now you see me").expect("commit");
    t.user("tail").expect("commit");
    t.compile().expect("compile");

    t.annotate(&target.commit_hash, Priority::Skip).expect("annotate");
    assert_eq!(t.compile().expect("compile").messages.len(), 1);

    t.annotate(&target.commit_hash, Priority::Normal).expect("annotate");
    let ctx = t.compile().expect("compile");
    assert_eq!(ctx.messages.len(), 2);
    assert_eq!(ctx.messages[0].content, "now you see me");
}

fn scripted_with_usage(text: &str, prompt_tokens: usize, completion_tokens: usize) -> ScriptedClient {
    ScriptedClient::new([ChatCompletion {
        content: text.to_string(),
        usage: Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }),
        ..Default::default()
    }])
}

/// chat() commits the user message and the assistant reply, persists a
/// compile record, and calibrates the cache with API-reported usage.
#[test]
fn chat_records_and_calibrates() {
    let mut t = Tract::open_in_memory().expect("open");
    t.set_llm_client(Rc::new(scripted_with_usage("Hello there.", 500, 7)) as Rc<dyn LlmClient>);
    t.system("You are helpful.").expect("system");

    let response = t.chat("Hi").expect("chat");
    assert_eq!(response.text, "Hello there.");
    assert_eq!(response.prompt.as_deref(), Some("Hi"));
    assert_eq!(response.usage.expect("usage").prompt_tokens, 500);

    // One record, pointing at the prompt head with the API-sourced
    // count and the effective ordering.
    let records = t.compile_records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].token_count, 500);
    assert_eq!(records[0].token_source, "api:500+7");
    assert_eq!(records[0].commit_count, 2);

    // The calibrated base survives the assistant append: the new total
    // is the API count plus only the new message's tokens.
    let ctx = t.compile().expect("compile");
    assert!(ctx.token_source.starts_with("api:"));
    assert!(ctx.token_count > 500);
    assert!(ctx.token_count < 500 + 50);
    assert_eq!(ctx.messages.last().expect("reply").content, "Hello there.");
}

/// generate() consumes the existing context without committing a new
/// user message.
#[test]
fn generate_uses_existing_context() {
    let mut t = Tract::open_in_memory().expect("open");
    t.set_llm_client(Rc::new(ScriptedClient::replies(["Continuing."])) as Rc<dyn LlmClient>);
    t.system("sys").expect("system");
    t.user("finish my thought").expect("user");

    let response = t.generate().expect("generate");
    assert_eq!(response.prompt, None);
    assert_eq!(response.text, "Continuing.");

    let ctx = t.compile().expect("compile");
    assert_eq!(ctx.messages.len(), 3);
}

/// chat() and generate() are rejected inside batch(); plain commits
/// are fine.
#[test]
fn batch_defers_llm_work() {
    let mut t = Tract::open_in_memory().expect("open");
    t.set_llm_client(Rc::new(ScriptedClient::replies(["x"])) as Rc<dyn LlmClient>);

    let result: tract::Result<()> = t.batch(|t| {
        t.user("inside batch")?;
        let err = t.chat("nope").unwrap_err();
        assert!(err.to_string().contains("not allowed inside batch"));
        Ok(())
    });
    result.expect("batch");

    // Batch mode ends with the closure.
    t.chat("now it works").expect("chat");
}

/// Reasoning in the completion is committed separately before the
/// assistant reply.
#[test]
fn reasoning_commits_before_reply() {
    let mut t = Tract::open_in_memory().expect("open");
    t.set_llm_client(Rc::new(ScriptedClient::new([ChatCompletion {
        content: "The answer is 4.".to_string(),
        reasoning: Some("2 + 2 carries no remainder.".to_string()),
        ..Default::default()
    }])) as Rc<dyn LlmClient>);
    t.user("2+2?").expect("user");

    let response = t.generate().expect("generate");
    let reasoning_commit = response.reasoning_commit.expect("reasoning commit");
    assert_eq!(reasoning_commit.content_type, "reasoning");
    assert_eq!(
        response.commit_info.parent_hash.as_deref(),
        Some(reasoning_commit.commit_hash.as_str())
    );
}
