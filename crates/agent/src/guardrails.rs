use std::sync::LazyLock;

use regex::Regex;

static PROTOCOL_KEYS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(name|parameters|arguments|tool_calls|function)"\s*:"#)
        .expect("protocol key pattern compiles")
});

static NARRATED_ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(the request should include|the call (should|would) (include|look like)|i will (now )?(call|use|invoke|run|query)|i'll (now )?(call|use|invoke|run|query)|i am going to (call|use|invoke|run)|let me (call|use|invoke|run|query)|i need to (call|use|invoke)|i would (call|use|invoke))\b",
    )
    .expect("narrated action pattern compiles")
});

static TOOL_NAME_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b").expect("tool name pattern compiles")
});

static PROCEDURAL_VOCABULARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(function call|call(ed|ing)? the (\w+ )?function|the (\w+ )?function returned|tool call|json schema|(with|using|set) the (\w+ )?parameters?|parameters? (was|were|is|are) (set|passed|missing))\b",
    )
    .expect("procedural vocabulary pattern compiles")
});

static OPAQUE_ID_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[a-z0-9]{26}\b").expect("opaque id token pattern compiles")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationContext<'a> {
    pub turn: u32,
    pub max_turns: u32,
    /// Tools offered this conversation. Snake-case words are only leakage when
    /// they name one of these; channel and user names often look the same.
    pub tool_names: &'a [String],
}

impl ValidationContext<'_> {
    fn near_budget_ceiling(&self) -> bool {
        self.turn.saturating_add(1) >= self.max_turns
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Accept,
    Reject { reason_code: &'static str, corrective_message: String },
}

impl GuardrailDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Stateless checks on free-text LLM output before it is taken as an answer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResponseValidator;

impl ResponseValidator {
    pub fn validate(&self, text: &str, context: ValidationContext) -> GuardrailDecision {
        let trimmed = text.trim();

        if trimmed.starts_with('{') && PROTOCOL_KEYS.is_match(trimmed) {
            return GuardrailDecision::Reject {
                reason_code: "leaked_structured_output",
                corrective_message: "Your last reply was a tool call written as text. Do not write \
                                     JSON in your reply. Use the tool-calling interface to invoke \
                                     tools, or answer the user in plain language."
                    .to_string(),
            };
        }

        if !context.near_budget_ceiling() && NARRATED_ACTION.is_match(trimmed) {
            return GuardrailDecision::Reject {
                reason_code: "describing_instead_of_acting",
                corrective_message: "You described an action instead of taking it. Invoke the \
                                     tool now through the tool-calling interface, or give the \
                                     user the final answer."
                    .to_string(),
            };
        }

        if let Some(token) = technical_leak(trimmed, context.tool_names) {
            return GuardrailDecision::Reject {
                reason_code: "technical_leakage",
                corrective_message: format!(
                    "Rewrite your last reply for a non-technical reader. It mentioned `{token}`. \
                     Never mention tool names, functions, parameters or raw identifiers; refer \
                     to channels and people by their names."
                ),
            };
        }

        GuardrailDecision::Accept
    }
}

fn technical_leak(text: &str, tool_names: &[String]) -> Option<String> {
    let leaked_tool = TOOL_NAME_TOKEN.find_iter(text).find(|found| {
        !inside_link(text, found.start())
            && tool_names.iter().any(|name| name.eq_ignore_ascii_case(found.as_str()))
    });
    if let Some(found) = leaked_tool {
        return Some(found.as_str().to_string());
    }
    if let Some(found) = PROCEDURAL_VOCABULARY.find(text) {
        return Some(found.as_str().to_string());
    }
    OPAQUE_ID_TOKEN
        .find_iter(text)
        .find(|found| found.as_str().chars().any(|c| c.is_ascii_digit()))
        .map(|found| found.as_str().to_string())
}

/// Snake-case inside a URL or email address is not leakage.
fn inside_link(text: &str, offset: usize) -> bool {
    let word_start = text[..offset].rfind(char::is_whitespace).map_or(0, |index| index + 1);
    let word = &text[word_start..];
    let word = word.split_whitespace().next().unwrap_or_default();
    word.contains("://") || word.contains('@')
}

#[cfg(test)]
mod tests {
    use super::{GuardrailDecision, ResponseValidator, ValidationContext};

    const EARLY: ValidationContext<'static> =
        ValidationContext { turn: 1, max_turns: 8, tool_names: &[] };
    const LAST: ValidationContext<'static> =
        ValidationContext { turn: 7, max_turns: 8, tool_names: &[] };

    fn tools() -> Vec<String> {
        ["list_channels", "search_channels", "get_channel_history"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn reason(decision: GuardrailDecision) -> Option<&'static str> {
        match decision {
            GuardrailDecision::Accept => None,
            GuardrailDecision::Reject { reason_code, .. } => Some(reason_code),
        }
    }

    #[test]
    fn plain_answers_are_accepted_and_verdict_is_stable() {
        let validator = ResponseValidator;
        let answer = "There are two channels: general and dev-team.";
        let first = validator.validate(answer, EARLY);
        let second = validator.validate(answer, EARLY);
        assert_eq!(first, GuardrailDecision::Accept);
        assert_eq!(first, second);
    }

    #[test]
    fn leaked_tool_call_json_is_rejected() {
        let text = r#"{"name": "list_channels", "parameters": {}}"#;
        assert_eq!(reason(ResponseValidator.validate(text, EARLY)), Some("leaked_structured_output"));
        assert_eq!(reason(ResponseValidator.validate(text, LAST)), Some("leaked_structured_output"));
    }

    #[test]
    fn narration_is_rejected_until_the_budget_ceiling() {
        let text = "I will call the channel lookup and then summarise it for you.";
        assert_eq!(
            reason(ResponseValidator.validate(text, EARLY)),
            Some("describing_instead_of_acting")
        );
        assert_eq!(reason(ResponseValidator.validate(text, LAST)), None);
    }

    #[test]
    fn internal_vocabulary_is_sent_back_for_a_rewrite() {
        let names = tools();
        let context = ValidationContext { tool_names: &names, ..EARLY };
        for text in [
            "I used search_channels to find it.",
            "The function call returned nothing useful.",
            "Channel abcdefghij0123456789klmnop has 4 members.",
        ] {
            assert_eq!(
                reason(ResponseValidator.validate(text, context)),
                Some("technical_leakage"),
                "{text}"
            );
        }
    }

    #[test]
    fn underscore_names_of_channels_and_people_are_accepted() {
        let names = tools();
        for turn in [1, 8] {
            let context = ValidationContext { turn, max_turns: 8, tool_names: &names };
            for text in [
                "You have two channels: general and release_notes.",
                "The last message in dev-team came from john_doe.",
            ] {
                assert_eq!(
                    ResponseValidator.validate(text, context),
                    GuardrailDecision::Accept,
                    "{text}"
                );
            }
        }
    }

    #[test]
    fn links_with_underscores_are_not_leakage() {
        let text = "The notes are at https://wiki.example.com/team_notes/q3_plan.";
        assert_eq!(ResponseValidator.validate(text, EARLY), GuardrailDecision::Accept);
    }
}
