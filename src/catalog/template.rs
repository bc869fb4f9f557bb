//! Message template model.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Reserved template categories.
pub mod category {
    pub const TRIAL: &str = "trial";
    pub const SEQUENCE: &str = "sequence";
    pub const POST_TRIAL: &str = "post_trial";
    pub const MANUAL: &str = "manual";
    pub const SYSTEM: &str = "system";
    pub const CRISIS: &str = "crisis";
    pub const FOLLOWUP: &str = "followup";

    /// Categories never drawn from the algorithm-mode pool.
    pub const RESERVED: &[&str] = &[TRIAL, POST_TRIAL, MANUAL, SYSTEM, CRISIS, FOLLOWUP];
}

/// A capital letter at a word boundary followed by a closing paren.
static OPTION_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([A-Z])\)").unwrap());

/// Program tag matching every recipient (used by unfiltered injections).
pub const ALL_PROGRAMS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    #[default]
    Standard,
    Interactive,
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionType::Standard => write!(f, "standard"),
            InteractionType::Interactive => write!(f, "interactive"),
        }
    }
}

impl FromStr for InteractionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(InteractionType::Standard),
            "interactive" => Ok(InteractionType::Interactive),
            other => Err(format!("unknown interaction type: {other}")),
        }
    }
}

/// The declared answer letters of an interactive template, e.g. `A`..`D`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionSet(Vec<char>);

impl OptionSet {
    /// Build from declared letters. Letters are uppercased and de-duplicated.
    pub fn new(letters: impl IntoIterator<Item = char>) -> Result<Self, ValidationError> {
        let mut out: Vec<char> = Vec::new();
        for letter in letters {
            if !letter.is_ascii_alphabetic() {
                return Err(ValidationError::InvalidTemplate(format!(
                    "option {letter:?} is not a letter"
                )));
            }
            let upper = letter.to_ascii_uppercase();
            if !out.contains(&upper) {
                out.push(upper);
            }
        }
        Ok(Self(out))
    }

    /// Infer options from prose such as `"A) Calm  B) Tired"`.
    ///
    /// Only used when importing templates that carry no declared set.
    pub fn infer_from_body(body: &str) -> Self {
        let mut out: Vec<char> = Vec::new();
        for cap in OPTION_MARKER.captures_iter(body) {
            if let Some(c) = cap[1].chars().next()
                && !out.contains(&c)
            {
                out.push(c);
            }
        }
        Self(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn letters(&self) -> &[char] {
        &self.0
    }

    /// Match a raw reply against the set. Accepts `b`, `B`, `B)`, `B.` and
    /// surrounding whitespace.
    pub fn match_reply(&self, raw: &str) -> Option<char> {
        let trimmed = raw
            .trim()
            .trim_end_matches(|c: char| matches!(c, ')' | '.' | '!'));
        let mut chars = trimmed.chars();
        let first = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        let upper = first.to_ascii_uppercase();
        self.0.contains(&upper).then_some(upper)
    }

    /// Human listing for reprompts: `A, B, C, or D`.
    pub fn describe(&self) -> String {
        let letters: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        match letters.as_slice() {
            [] => String::new(),
            [one] => one.clone(),
            [a, b] => format!("{a} or {b}"),
            [rest @ .., last] => format!("{}, or {last}", rest.join(", ")),
        }
    }

    /// Storage form: the letters concatenated (`"ABCD"`).
    pub fn to_db(&self) -> String {
        self.0.iter().collect()
    }

    pub fn from_db(s: &str) -> Self {
        Self(
            s.chars()
                .filter(|c| c.is_ascii_alphabetic())
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        )
    }
}

/// A keyed message template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: String,
    #[serde(default)]
    pub sequence_number: Option<u32>,
    pub program: String,
    pub category: String,
    #[serde(default)]
    pub interaction: InteractionType,
    pub body: String,
    #[serde(default)]
    pub options: OptionSet,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl MessageTemplate {
    /// A standard, active, unnumbered template.
    pub fn new(
        id: impl Into<String>,
        program: impl Into<String>,
        category: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sequence_number: None,
            program: program.into(),
            category: category.into(),
            interaction: InteractionType::Standard,
            body: body.into(),
            options: OptionSet::default(),
            active: true,
        }
    }

    pub fn numbered(mut self, n: u32) -> Self {
        self.sequence_number = Some(n);
        self
    }

    pub fn interactive(mut self, options: OptionSet) -> Self {
        self.interaction = InteractionType::Interactive;
        self.options = options;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interaction == InteractionType::Interactive
    }

    /// Id of the branch-specific follow-up for `letter` (`q7` + `B` → `q7b`).
    pub fn followup_id(&self, letter: char) -> String {
        format!("{}{}", self.id, letter.to_ascii_lowercase())
    }

    /// Reject templates that cannot be stored.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::InvalidTemplate("empty id".into()));
        }
        if self.body.trim().is_empty() {
            return Err(ValidationError::InvalidTemplate(format!(
                "template {} has an empty body",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_options_from_body() {
        let set = OptionSet::infer_from_body(
            "How are you feeling? A) Calm B) Tired C) Anxious D) Great",
        );
        assert_eq!(set.letters(), &['A', 'B', 'C', 'D']);
    }

    #[test]
    fn infer_ignores_lowercase_and_mid_word() {
        let set = OptionSet::infer_from_body("Reply (a) or X) or maybeB)");
        assert_eq!(set.letters(), &['X']);
    }

    #[test]
    fn match_reply_variants() {
        let set = OptionSet::new(['A', 'B', 'C', 'D']).unwrap();
        assert_eq!(set.match_reply("b"), Some('B'));
        assert_eq!(set.match_reply("  B) "), Some('B'));
        assert_eq!(set.match_reply("D."), Some('D'));
        assert_eq!(set.match_reply("E"), None);
        assert_eq!(set.match_reply("BC"), None);
        assert_eq!(set.match_reply(""), None);
    }

    #[test]
    fn describe_lists_letters() {
        assert_eq!(OptionSet::new(['A']).unwrap().describe(), "A");
        assert_eq!(OptionSet::new(['A', 'B']).unwrap().describe(), "A or B");
        assert_eq!(
            OptionSet::new(['a', 'b', 'c', 'd']).unwrap().describe(),
            "A, B, C, or D"
        );
    }

    #[test]
    fn new_rejects_non_letters() {
        assert!(OptionSet::new(['A', '1']).is_err());
    }

    #[test]
    fn db_form_roundtrip() {
        let set = OptionSet::new(['A', 'C']).unwrap();
        assert_eq!(OptionSet::from_db(&set.to_db()), set);
    }

    #[test]
    fn followup_id_lowercases() {
        let t = MessageTemplate::new("mood_check", "Elevate", "sequence", "A) x B) y");
        assert_eq!(t.followup_id('B'), "mood_checkb");
    }

    #[test]
    fn validate_rejects_empty_body() {
        let t = MessageTemplate::new("x", "Elevate", "manual", "  ");
        assert!(t.validate().is_err());
    }
}
