//! Connection conditions for `conditional` chain steps.
//!
//! A condition is checked against the previous step's outcome:
//!
//! | Condition          | Passes when                                   |
//! |--------------------|-----------------------------------------------|
//! | `always` / empty   | always                                        |
//! | `never`            | never                                         |
//! | `contains:<t>`     | the previous response contains `t`            |
//! | `not_contains:<t>` | it does not                                   |
//! | `length>N`         | the response is longer than N characters      |
//! | `length<N`         | shorter than N                                |
//! | `success`          | the previous step completed without error     |
//! | `error`            | the previous step failed                      |
//! | anything else      | the response contains it as a keyword         |
//!
//! Text matching is case-insensitive.

use cs_domain::step::AgentStep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    Never,
    Contains(String),
    NotContains(String),
    LongerThan(usize),
    ShorterThan(usize),
    Success,
    Error,
    Keyword(String),
}

/// What a condition is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviousOutcome<'a> {
    pub response: &'a str,
    pub error: Option<&'a str>,
    pub completed: bool,
}

impl<'a> From<&'a AgentStep> for PreviousOutcome<'a> {
    fn from(step: &'a AgentStep) -> Self {
        let response = if step.response.is_empty() {
            step.streamed_content.as_str()
        } else {
            step.response.as_str()
        };
        Self {
            response,
            error: step.error.as_deref(),
            completed: step.is_complete && !step.was_skipped,
        }
    }
}

impl Condition {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lower = trimmed.to_lowercase();

        if lower.is_empty() || lower == "always" {
            return Condition::Always;
        }
        match lower.as_str() {
            "never" => return Condition::Never,
            "success" => return Condition::Success,
            "error" => return Condition::Error,
            _ => {}
        }
        if let Some(t) = lower.strip_prefix("not_contains:") {
            return Condition::NotContains(t.trim().to_owned());
        }
        if let Some(t) = lower.strip_prefix("contains:") {
            return Condition::Contains(t.trim().to_owned());
        }
        if let Some(n) = lower.strip_prefix("length>") {
            if let Ok(n) = n.trim().parse() {
                return Condition::LongerThan(n);
            }
        }
        if let Some(n) = lower.strip_prefix("length<") {
            if let Ok(n) = n.trim().parse() {
                return Condition::ShorterThan(n);
            }
        }
        Condition::Keyword(lower)
    }

    pub fn evaluate(&self, previous: &PreviousOutcome<'_>) -> bool {
        let response = previous.response.to_lowercase();
        match self {
            Condition::Always => true,
            Condition::Never => false,
            Condition::Contains(t) | Condition::Keyword(t) => response.contains(t.as_str()),
            Condition::NotContains(t) => !response.contains(t.as_str()),
            Condition::LongerThan(n) => previous.response.chars().count() > *n,
            Condition::ShorterThan(n) => previous.response.chars().count() < *n,
            Condition::Success => previous.completed && previous.error.is_none(),
            Condition::Error => previous.error.is_some(),
        }
    }

    /// Human-readable reason recorded when a step is skipped.
    pub fn skip_reason(&self, raw: &str) -> String {
        format!("condition '{}' not met by the previous step", raw.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prev(response: &str) -> PreviousOutcome<'_> {
        PreviousOutcome {
            response,
            error: None,
            completed: true,
        }
    }

    #[test]
    fn grammar() {
        assert_eq!(Condition::parse(""), Condition::Always);
        assert_eq!(Condition::parse(" ALWAYS "), Condition::Always);
        assert_eq!(Condition::parse("contains: Yes"), Condition::Contains("yes".into()));
        assert_eq!(Condition::parse("not_contains:no"), Condition::NotContains("no".into()));
        assert_eq!(Condition::parse("length>100"), Condition::LongerThan(100));
        assert_eq!(Condition::parse("length<5"), Condition::ShorterThan(5));
        assert_eq!(Condition::parse("length>lots"), Condition::Keyword("length>lots".into()));
        assert_eq!(Condition::parse("urgent"), Condition::Keyword("urgent".into()));
    }

    #[test]
    fn evaluation() {
        let p = prev("The answer is YES, approved.");
        assert!(Condition::parse("contains:yes").evaluate(&p));
        assert!(!Condition::parse("not_contains:approved").evaluate(&p));
        assert!(Condition::parse("length>10").evaluate(&p));
        assert!(!Condition::parse("length<10").evaluate(&p));
        assert!(Condition::parse("Approved").evaluate(&p));
        assert!(!Condition::parse("never").evaluate(&p));
        assert!(Condition::parse("success").evaluate(&p));
        assert!(!Condition::parse("error").evaluate(&p));

        let failed = PreviousOutcome {
            response: "",
            error: Some("timeout"),
            completed: true,
        };
        assert!(Condition::parse("error").evaluate(&failed));
        assert!(!Condition::parse("success").evaluate(&failed));
    }

    #[test]
    fn missing_previous_step_only_passes_unconditional_checks() {
        let none = PreviousOutcome::default();
        assert!(Condition::parse("always").evaluate(&none));
        assert!(!Condition::parse("success").evaluate(&none));
        assert!(!Condition::parse("contains:x").evaluate(&none));
    }
}
