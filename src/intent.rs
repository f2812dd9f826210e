//! Keyword-rule classification of assistant queries.
//!
//! Rules are checked in a fixed order and the first rule with a matching
//! cue wins; cues are case-insensitive substrings. A query matching nothing
//! is [`Intent::General`].

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    Summarize,
    Search,
    Draft,
    ReplySuggestion,
    Organize,
    FollowUp,
    Analytics,
    Priority,
    Calendar,
    General,
}

const RULES: &[(Intent, &[&str])] = &[
    (Intent::Summarize, &["summarize", "summary", "overview"]),
    (Intent::Search, &["find", "search", "look for", "show me"]),
    (Intent::Draft, &["draft", "write", "compose", "create email"]),
    (Intent::ReplySuggestion, &["reply", "respond to", "answer"]),
    (Intent::Organize, &["organize", "sort", "categorize", "clean up"]),
    (Intent::FollowUp, &["follow up", "followup", "remind"]),
    (Intent::Analytics, &["statistics", "stats", "analytics", "patterns"]),
    (Intent::Priority, &["important", "priority", "urgent"]),
    (Intent::Calendar, &["schedule", "calendar", "meeting"]),
];

const DEFAULT_SUGGESTIONS: [&str; 3] = [
    "Summarize my recent emails",
    "Help me organize my inbox",
    "Find important emails I might have missed",
];

impl Intent {
    pub fn classify(query: &str) -> Self {
        let lower = query.to_lowercase();
        RULES
            .iter()
            .find(|(_, cues)| cues.iter().any(|cue| lower.contains(cue)))
            .map(|(intent, _)| *intent)
            .unwrap_or(Intent::General)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Summarize => "summarize",
            Intent::Search => "search",
            Intent::Draft => "draft",
            Intent::ReplySuggestion => "reply-suggestion",
            Intent::Organize => "organize",
            Intent::FollowUp => "follow-up",
            Intent::Analytics => "analytics",
            Intent::Priority => "priority",
            Intent::Calendar => "calendar",
            Intent::General => "general",
        }
    }

    /// System prompt for the response generator, addressed to `user_name`.
    pub fn system_prompt(&self, user_name: &str) -> String {
        let focus = match self {
            Intent::Summarize => "Focus on providing clear, organized summaries of emails. Highlight key information, action items, and important dates.",
            Intent::Search => "Help find relevant emails based on the user's search criteria. Provide specific matches and explain why they're relevant.",
            Intent::Draft => "Help compose professional emails. Consider the recipient, purpose, and appropriate tone. Provide a complete draft with proper structure.",
            Intent::ReplySuggestion => "Suggest appropriate email replies. Consider the original message context and maintain professional communication style.",
            Intent::Organize => "Provide suggestions for organizing emails efficiently. Consider folder structures and rules.",
            Intent::FollowUp => "Help with follow-up strategies. Identify emails that need responses and suggest appropriate follow-up actions.",
            Intent::Analytics => "Provide insights into email patterns, productivity metrics, and communication analytics. Present data in a clear, actionable format.",
            Intent::Priority => "Help identify and prioritize important emails. Focus on urgency, sender importance, and content relevance.",
            Intent::Calendar => "Help with calendar and meeting-related email tasks. Consider scheduling, invitations, and time management.",
            Intent::General => "Answer general questions about email management and provide helpful advice.",
        };
        format!(
            "You are an AI assistant helping {} manage their emails. \
             You have access to their email data and can help with various email-related tasks. \
             Be helpful, professional, and concise in your responses. {}",
            user_name, focus
        )
    }

    /// Fixed follow-up suggestions for this intent.
    pub fn suggestions(&self) -> [&'static str; 3] {
        match self {
            Intent::Summarize => [
                "Show me the most urgent emails",
                "Find emails from last week",
                "Help me organize my inbox",
            ],
            Intent::Search => [
                "Search for emails about projects",
                "Find emails from specific people",
                "Show me emails with attachments",
            ],
            Intent::Draft => [
                "Help me write a follow-up email",
                "Draft a meeting request",
                "Compose a professional introduction",
            ],
            Intent::ReplySuggestion => [
                "Draft a different tone reply",
                "Suggest a meeting time",
                "Help with a polite decline",
            ],
            Intent::Analytics => [
                "Show me my top email contacts",
                "Analyze my response time patterns",
                "Compare this month to last month",
            ],
            _ => DEFAULT_SUGGESTIONS,
        }
    }

    /// Intents that fall back to the newest messages when no search matched.
    pub fn wants_recent_fallback(&self) -> bool {
        matches!(self, Intent::Summarize | Intent::Priority)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        assert_eq!(Intent::classify("Summarize my unread emails"), Intent::Summarize);
        // "find" (search) outranks "important" (priority)
        assert_eq!(
            Intent::classify("find important emails"),
            Intent::Search
        );
        assert_eq!(Intent::classify("Write a note to Bob"), Intent::Draft);
        assert_eq!(Intent::classify("how should I respond to Ana?"), Intent::ReplySuggestion);
        assert_eq!(Intent::classify("please clean up my inbox"), Intent::Organize);
        assert_eq!(Intent::classify("Remind me about the invoice"), Intent::FollowUp);
        assert_eq!(Intent::classify("email stats for May"), Intent::Analytics);
        assert_eq!(Intent::classify("anything URGENT?"), Intent::Priority);
        assert_eq!(Intent::classify("when is the meeting"), Intent::Calendar);
        assert_eq!(Intent::classify("hello there"), Intent::General);
        assert_eq!(Intent::classify(""), Intent::General);
    }

    #[test]
    fn prompts_and_suggestions() {
        let prompt = Intent::Summarize.system_prompt("Ana");
        assert!(prompt.starts_with("You are an AI assistant helping Ana"));
        assert!(prompt.contains("action items"));
        assert!(Intent::ReplySuggestion
            .system_prompt("Ana")
            .contains("maintain professional communication style"));

        assert_eq!(Intent::Calendar.suggestions(), DEFAULT_SUGGESTIONS);
        assert_eq!(Intent::Search.suggestions()[0], "Search for emails about projects");
        assert_eq!(Intent::FollowUp.to_string(), "follow-up");
    }
}
