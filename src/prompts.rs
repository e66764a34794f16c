//! Prompt text for compression summarization.
//!
//! Consumed opaquely by the compression operation; callers can replace
//! the system prompt per call.

/// Default system prompt for compression summaries.
pub const SUMMARIZE_SYSTEM_PROMPT: &str = "You compress LLM conversation history. Produce a \
single dense summary of the transcript you are given. Preserve facts, decisions, identifiers, \
code snippets, and open questions; drop pleasantries and repetition. Reply with the summary \
text only.";

/// Build the user prompt for one compression group.
pub fn build_summarize_prompt(
    transcript: &str,
    target_tokens: Option<usize>,
    instructions: Option<&str>,
    retention_instructions: &[String],
) -> String {
    let mut prompt = String::new();
    if let Some(target) = target_tokens {
        prompt.push_str(&format!("Summarize in at most about {target} tokens.\n\n"));
    }
    if let Some(extra) = instructions {
        if !extra.is_empty() {
            prompt.push_str(extra);
            prompt.push_str("\n\n");
        }
    }
    if !retention_instructions.is_empty() {
        prompt.push_str("The summary MUST preserve the following:\n");
        for instruction in retention_instructions {
            prompt.push_str("- ");
            prompt.push_str(instruction);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    prompt.push_str("Transcript:\n");
    prompt.push_str(transcript);
    prompt
}

/// Wrap a failed draft and its diagnosis into retry guidance.
pub fn build_retry_guidance(previous_summary: &str, diagnosis: &str) -> String {
    format!(
        "Your previous summary was rejected: {diagnosis}\n\nPrevious summary:\n{previous_summary}\n\nProduce a corrected summary."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Retention lines appear verbatim in the prompt.
    #[test]
    fn test_prompt_includes_retention() {
        let prompt = build_summarize_prompt(
            "u: hi",
            Some(100),
            Some("keep code"),
            &["the API key sk-1".to_string()],
        );
        assert!(prompt.contains("at most about 100 tokens"));
        assert!(prompt.contains("keep code"));
        assert!(prompt.contains("- the API key sk-1"));
        assert!(prompt.ends_with("u: hi"));
    }
}
