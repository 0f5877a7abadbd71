use chrono::{DateTime, Utc};

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a workspace assistant for a team-messaging platform. You act on the user's behalf \
through the tools you are given.

Rules:
- When an action or lookup is needed, call the tool. Never describe a call you intend to make.
- Never write tool calls as JSON text in your reply.
- Reuse identifiers you already have instead of searching again.
- If a tool reports missing access, stop and explain that boundary to the user.
- Answer in plain language. Refer to channels and people by name, never by raw identifier, \
  and never mention tools, functions or parameters.";

/// Assembles the system message for one conversation.
#[derive(Clone, Debug)]
pub struct PromptBuilder {
    base: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self { base: DEFAULT_SYSTEM_PROMPT.to_string() }
    }
}

impl PromptBuilder {
    /// `None` or a blank override keeps the built-in prompt.
    pub fn new(base: Option<&str>) -> Self {
        match base.map(str::trim).filter(|base| !base.is_empty()) {
            Some(base) => Self { base: base.to_string() },
            None => Self::default(),
        }
    }

    pub fn build(&self, user_id: &str, reference: Option<&str>, now: DateTime<Utc>) -> String {
        let mut prompt = self.base.clone();
        prompt.push_str("\n\nCurrent date: ");
        prompt.push_str(&now.format("%Y-%m-%d").to_string());
        if !user_id.trim().is_empty() {
            prompt.push_str("\nRequesting user id: ");
            prompt.push_str(user_id.trim());
        }
        if let Some(reference) = reference.map(str::trim).filter(|text| !text.is_empty()) {
            prompt.push_str(
                "\n\nReference data (use these identifiers directly, no lookup needed):\n",
            );
            prompt.push_str(reference);
        }
        prompt
    }
}
