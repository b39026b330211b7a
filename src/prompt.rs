//! Turn prompts
//!
//! Only the latest statement is ever forwarded, so prompt size stays
//! bounded no matter how long the conversation runs.

/// Opening prompt for the first speaker
pub fn seed(topic: &str) -> String {
    format!(
        "Debate Topic: {}. Present your arguments concisely, as if in a human conversation. \
         Aim for responses of around 2-4 sentences. Do not reveal that you are an AI or chatbot. \
         Please start with your opening statement.",
        topic
    )
}

/// Placeholder for the second speaker until the first one has spoken
pub fn holding() -> String {
    "Waiting for the initial statement...".to_string()
}

/// First relayed turn: frame the topic plus the opening statement
pub fn first_follow_up(topic: &str, statement: &str) -> String {
    format!(
        "This is a debate on the topic: {}\n\nThe other participant stated: \"{}\"\n\n\
         Please respond with your perspective on this topic. Keep your response concise \
         (2-4 sentences) and engage directly with their points.",
        topic, statement
    )
}

/// Every later turn: the latest statement only
pub fn follow_up(topic: &str, statement: &str) -> String {
    format!(
        "Continuing our debate on: {}\n\nThe other participant just said: \"{}\"\n\n\
         Respond directly to their points. Keep your response concise (2-4 sentences).",
        topic, statement
    )
}

/// Re-prompt after endpoints were rebound (snapshot restore)
pub fn resume(topic: &str, last_statement: Option<&str>) -> String {
    match last_statement {
        Some(statement) => follow_up(topic, statement),
        None => seed(topic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_follow_up_carries_topic_and_statement() {
        let prompt = first_follow_up("T", "A1");
        assert!(prompt.contains("topic: T"));
        assert!(prompt.contains("\"A1\""));
    }

    #[test]
    fn test_follow_up_has_only_latest_statement() {
        let prompt = follow_up("T", "B1");
        assert!(prompt.contains("\"B1\""));
        assert!(!prompt.contains("A1"));
    }

    #[test]
    fn test_resume_without_history_is_seed() {
        assert_eq!(resume("T", None), seed("T"));
        assert_eq!(resume("T", Some("x")), follow_up("T", "x"));
    }
}
