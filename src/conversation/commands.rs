//! Inbound text classification: system commands and crisis keywords.
//!
//! Matching is on the whole message, trimmed, case-insensitive, with
//! trailing punctuation ignored. Commands take precedence over crisis
//! keywords, which take precedence over everything else.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    Stop,
    Start,
    Reset,
}

impl SystemCommand {
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "STOP" | "STOPALL" | "UNSUBSCRIBE" | "CANCEL" | "END" | "QUIT" => {
                Some(SystemCommand::Stop)
            }
            "START" | "UNSTOP" => Some(SystemCommand::Start),
            "RESET" => Some(SystemCommand::Reset),
            _ => None,
        }
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemCommand::Stop => write!(f, "STOP"),
            SystemCommand::Start => write!(f, "START"),
            SystemCommand::Reset => write!(f, "RESET"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrisisKeyword {
    Help,
    Anxiety,
    Stress,
    Panic,
    Crisis,
    Calm,
    Breathe,
    Positive,
    Affirm,
}

impl CrisisKeyword {
    pub const ALL: [CrisisKeyword; 9] = [
        CrisisKeyword::Help,
        CrisisKeyword::Anxiety,
        CrisisKeyword::Stress,
        CrisisKeyword::Panic,
        CrisisKeyword::Crisis,
        CrisisKeyword::Calm,
        CrisisKeyword::Breathe,
        CrisisKeyword::Positive,
        CrisisKeyword::Affirm,
    ];

    pub fn parse(word: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == word)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrisisKeyword::Help => "HELP",
            CrisisKeyword::Anxiety => "ANXIETY",
            CrisisKeyword::Stress => "STRESS",
            CrisisKeyword::Panic => "PANIC",
            CrisisKeyword::Crisis => "CRISIS",
            CrisisKeyword::Calm => "CALM",
            CrisisKeyword::Breathe => "BREATHE",
            CrisisKeyword::Positive => "POSITIVE",
            CrisisKeyword::Affirm => "AFFIRM",
        }
    }

    /// Catalog id of the keyword's response template.
    pub fn template_id(&self) -> String {
        format!("crisis_{}", self.as_str().to_ascii_lowercase())
    }

    /// Reply used when the catalog has no template for the keyword.
    pub fn fallback(&self) -> &'static str {
        match self {
            CrisisKeyword::Help => {
                "If you need support right now, call or text 988 to reach the Suicide & Crisis Lifeline. Reply STOP to unsubscribe."
            }
            CrisisKeyword::Anxiety | CrisisKeyword::Panic => {
                "You're not alone. Try breathing in for 4, holding for 4, and out for 6. If you're in danger, call or text 988."
            }
            CrisisKeyword::Stress => {
                "Pause for a moment and drop your shoulders. One slow breath at a time. If it feels like too much, call or text 988."
            }
            CrisisKeyword::Crisis => {
                "Please reach out now: call or text 988 for the Suicide & Crisis Lifeline, or call 911 if you're in immediate danger."
            }
            CrisisKeyword::Calm | CrisisKeyword::Breathe => {
                "Breathe in slowly through your nose, hold, then exhale through your mouth. Repeat three times."
            }
            CrisisKeyword::Positive | CrisisKeyword::Affirm => {
                "You are doing better than you think. Small steps still move you forward."
            }
        }
    }
}

/// What an inbound message is, before any recipient state is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Command(SystemCommand),
    Crisis(CrisisKeyword),
    Text,
}

pub fn classify(raw: &str) -> Inbound {
    let word = raw
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_ascii_uppercase();
    if let Some(cmd) = SystemCommand::parse(&word) {
        return Inbound::Command(cmd);
    }
    if let Some(keyword) = CrisisKeyword::parse(&word) {
        return Inbound::Crisis(keyword);
    }
    Inbound::Text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_and_synonyms() {
        assert_eq!(classify("stop"), Inbound::Command(SystemCommand::Stop));
        assert_eq!(classify("  Unsubscribe "), Inbound::Command(SystemCommand::Stop));
        assert_eq!(classify("QUIT!"), Inbound::Command(SystemCommand::Stop));
        assert_eq!(classify("unstop"), Inbound::Command(SystemCommand::Start));
        assert_eq!(classify("Reset"), Inbound::Command(SystemCommand::Reset));
    }

    #[test]
    fn crisis_keywords() {
        assert_eq!(classify("help"), Inbound::Crisis(CrisisKeyword::Help));
        assert_eq!(classify("PANIC."), Inbound::Crisis(CrisisKeyword::Panic));
        assert_eq!(CrisisKeyword::Breathe.template_id(), "crisis_breathe");
    }

    #[test]
    fn everything_else_is_text() {
        assert_eq!(classify("B"), Inbound::Text);
        assert_eq!(classify("please stop texting"), Inbound::Text);
        assert_eq!(classify(""), Inbound::Text);
    }
}
