//! Dialogue prompt construction

/// Stands in for an empty transcript
pub const NO_TRANSCRIPT_PLACEHOLDER: &str = "(no transcript available)";

/// Build the completion prompt for one dialogue turn
///
/// ```text
/// {instructions}
///
/// User: {transcript}
/// Assistant:
/// ```
///
/// The instructions block is omitted when absent or blank.
pub fn build_dialogue_prompt(transcript: &str, instructions: Option<&str>) -> String {
    let user_text = match transcript.trim() {
        "" => NO_TRANSCRIPT_PLACEHOLDER,
        text => text,
    };

    match instructions.map(str::trim).filter(|i| !i.is_empty()) {
        Some(instructions) => format!("{}\n\nUser: {}\nAssistant:", instructions, user_text),
        None => format!("User: {}\nAssistant:", user_text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_with_instructions() {
        let prompt = build_dialogue_prompt(" hello ", Some("Be brief.\n"));
        assert_eq!(prompt, "Be brief.\n\nUser: hello\nAssistant:");
    }

    #[test]
    fn test_prompt_without_instructions() {
        assert_eq!(build_dialogue_prompt("hi", None), "User: hi\nAssistant:");
        assert_eq!(build_dialogue_prompt("hi", Some("   ")), "User: hi\nAssistant:");
    }

    #[test]
    fn test_empty_transcript_placeholder() {
        let prompt = build_dialogue_prompt("  ", None);
        assert_eq!(prompt, "User: (no transcript available)\nAssistant:");
    }
}
