//! `@mention` parsing for supervisor turns.
//!
//! Resolves mentions in free text to the agent steps of a session and cuts
//! out the task text addressed to each. Names are matched
//! case-insensitively against the display name, `agent N`, `agentN`, bare
//! `N` (1-based), and the model id when only one step uses it.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use cs_domain::capability::ModelFamily;
use cs_domain::step::{AgentStep, MentionTask};

/// Used when a mention carries no task text and the message has no clear
/// instruction either.
pub const CONTINUE_PROMPT: &str =
    "Please continue with your previous task, taking into account the latest conversation context.";

const ACTION_VERBS: &[&str] = &[
    "improve", "enhance", "refine", "update", "revise", "analyze", "review", "examine",
    "evaluate", "create", "generate", "write", "draft", "summarize", "explain", "clarify",
];

/// Capability keywords and the model families preferred for them, in
/// priority order.
const CAPABILITY_KEYWORDS: &[(&[&str], &[ModelFamily])] = &[
    (
        &["analyze", "analysis", "reason", "logic", "math"],
        &[ModelFamily::OpenAiReasoning, ModelFamily::Anthropic, ModelFamily::DeepSeek],
    ),
    (
        &["write", "writing", "draft", "essay", "article"],
        &[ModelFamily::Anthropic, ModelFamily::OpenAi],
    ),
    (
        &["code", "coding", "program", "function", "debug"],
        &[ModelFamily::Anthropic, ModelFamily::DeepSeek, ModelFamily::OpenAi],
    ),
    (
        &["image", "picture", "photo", "vision", "diagram"],
        &[ModelFamily::Google, ModelFamily::OpenAi],
    ),
    (
        &["creative", "story", "poem", "brainstorm"],
        &[ModelFamily::Anthropic, ModelFamily::Xai],
    ),
];

const SEPARATORS: &[char] = &[',', ';', ':', '.', '-', '–', '—'];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An agent a mention can point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAgent {
    pub index: usize,
    pub name: Option<String>,
    pub model: String,
}

impl KnownAgent {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) if !n.trim().is_empty() => n.clone(),
            _ => format!("Agent {}", self.index + 1),
        }
    }
}

impl From<&AgentStep> for KnownAgent {
    fn from(step: &AgentStep) -> Self {
        Self {
            index: step.index,
            name: step.name.clone(),
            model: step.model.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedMentions {
    pub mentions: Vec<MentionTask>,
    /// `@name` texts that did not resolve to any agent.
    pub invalid: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // `@` must open the text or follow a non-word character, so email
        // addresses are not mentions.
        Regex::new(r"(?:^|[^\w])@([\w.\-]+(?:\s+[\w.\-]+)*)").expect("mention pattern is valid")
    })
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w.\-]+").expect("word pattern is valid"))
}

/// Parse mentions, falling back to inference when none resolve.
pub fn parse_mentions(text: &str, agents: &[KnownAgent]) -> ParsedMentions {
    let mut parsed = parse_explicit(text, agents);
    if parsed.mentions.is_empty() {
        parsed.mentions.extend(infer_target(text, agents));
    }
    parsed
}

/// Parse only explicit `@mentions`.
pub fn parse_explicit(text: &str, agents: &[KnownAgent]) -> ParsedMentions {
    let lookup = build_lookup(agents);
    let mut parsed = ParsedMentions::default();
    let mut seen: HashSet<usize> = HashSet::new();

    for caps in mention_re().captures_iter(text) {
        let Some(body) = caps.get(1) else {
            continue;
        };
        let words: Vec<regex::Match<'_>> = word_re().find_iter(body.as_str()).collect();

        // Longest prefix of the captured words that names an agent.
        let resolved = (1..=words.len()).rev().find_map(|n| {
            let key = words[..n]
                .iter()
                .map(|w| w.as_str())
                .collect::<Vec<_>>()
                .join(" ")
                .trim_end_matches(['.', '-'])
                .to_lowercase();
            lookup
                .get(&key)
                .map(|&index| (index, body.start() + words[n - 1].end()))
        });

        let Some((index, name_end)) = resolved else {
            let first = words.first().map(|w| w.as_str()).unwrap_or_default();
            parsed.invalid.push(format!("@{first}"));
            continue;
        };

        if !seen.insert(index) {
            continue;
        }

        let rest = &text[name_end..];
        let task_end = next_mention_start(rest);
        let task = trim_task(&rest[..task_end]);

        let Some(agent) = agents.iter().find(|a| a.index == index) else {
            continue;
        };
        parsed.mentions.push(MentionTask {
            agent_index: index,
            agent_name: agent.display_name(),
            task_prompt: if task.is_empty() {
                fallback_task(text)
            } else {
                task.to_owned()
            },
        });
    }

    parsed
}

/// Offset of the next `@` that could open a mention, or `text.len()`.
fn next_mention_start(text: &str) -> usize {
    text.char_indices()
        .find(|&(i, c)| {
            c == '@'
                && text[..i]
                    .chars()
                    .next_back()
                    .map_or(true, |prev| !(prev.is_alphanumeric() || prev == '_'))
        })
        .map_or(text.len(), |(i, _)| i)
}

fn build_lookup(agents: &[KnownAgent]) -> HashMap<String, usize> {
    let mut lookup = HashMap::new();

    let mut model_counts: HashMap<String, usize> = HashMap::new();
    for agent in agents {
        *model_counts.entry(agent.model.to_lowercase()).or_default() += 1;
    }

    for agent in agents {
        let n = agent.index + 1;
        // Numbered aliases go in first so a display name can't be shadowed
        // by another agent's number.
        lookup.entry(format!("agent {n}")).or_insert(agent.index);
        lookup.entry(format!("agent{n}")).or_insert(agent.index);
        lookup.entry(n.to_string()).or_insert(agent.index);

        let model = agent.model.to_lowercase();
        if model_counts.get(&model) == Some(&1) {
            lookup.entry(model).or_insert(agent.index);
        }
    }
    for agent in agents {
        if let Some(name) = agent.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            let key = name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
            lookup.insert(key, agent.index);
        }
    }
    lookup
}

fn trim_task(task: &str) -> &str {
    task.trim_matches(|c: char| c.is_whitespace() || SEPARATORS.contains(&c))
}

fn fallback_task(message: &str) -> String {
    if contains_any_word(message, ACTION_VERBS) {
        message.trim().to_owned()
    } else {
        CONTINUE_PROMPT.to_owned()
    }
}

fn contains_any_word(text: &str, words: &[&str]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .any(|w| words.contains(&w.as_str()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inference
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pick one agent for a message without mentions: a model id named in the
/// text first, then capability keywords against each agent's family.
pub fn infer_target(text: &str, agents: &[KnownAgent]) -> Option<MentionTask> {
    let message = text.trim();
    if message.is_empty() {
        return None;
    }
    let lower = message.to_lowercase();

    let by_model = agents
        .iter()
        .find(|a| !a.model.is_empty() && lower.contains(&a.model.to_lowercase()));

    let by_keyword = || {
        CAPABILITY_KEYWORDS
            .iter()
            .filter(|(keywords, _)| contains_any_word(&lower, keywords))
            .find_map(|(_, families)| {
                families.iter().find_map(|family| {
                    agents.iter().find(|a| ModelFamily::of(&a.model) == *family)
                })
            })
    };

    by_model.or_else(by_keyword).map(|agent| MentionTask {
        agent_index: agent.index,
        agent_name: agent.display_name(),
        task_prompt: message.to_owned(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(index: usize, name: Option<&str>, model: &str) -> KnownAgent {
        KnownAgent {
            index,
            name: name.map(Into::into),
            model: model.into(),
        }
    }

    fn two_agents() -> Vec<KnownAgent> {
        vec![agent(0, None, "gpt-4o"), agent(1, None, "claude-3-5-sonnet-latest")]
    }

    #[test]
    fn single_mention_with_task() {
        let parsed = parse_mentions("@Agent1 analyze this text", &two_agents());
        assert_eq!(
            parsed.mentions,
            vec![MentionTask {
                agent_index: 0,
                agent_name: "Agent 1".into(),
                task_prompt: "analyze this text".into(),
            }]
        );
        assert!(parsed.invalid.is_empty());
    }

    #[test]
    fn email_addresses_are_not_mentions() {
        let parsed = parse_explicit("mail bob@example.com the report", &two_agents());
        assert!(parsed.mentions.is_empty());
        assert!(parsed.invalid.is_empty());

        let parsed = parse_explicit("@Agent2 mail bob@example.com the report", &two_agents());
        assert_eq!(parsed.mentions.len(), 1);
        assert_eq!(parsed.mentions[0].task_prompt, "mail bob@example.com the report");
    }

    #[test]
    fn two_mentions_keep_textual_order() {
        let parsed = parse_mentions("@Agent2 summarize @Agent1 rewrite", &two_agents());
        let got: Vec<(usize, &str)> = parsed
            .mentions
            .iter()
            .map(|m| (m.agent_index, m.task_prompt.as_str()))
            .collect();
        assert_eq!(got, vec![(1, "summarize"), (0, "rewrite")]);
    }

    #[test]
    fn spaced_numbering_and_display_names_resolve() {
        let agents = vec![
            agent(0, Some("Research Bot"), "gpt-4o"),
            agent(1, None, "gpt-4o"),
        ];
        let parsed = parse_mentions(
            "@research bot: find sources; @Agent 2 - check them.",
            &agents,
        );
        assert_eq!(parsed.mentions.len(), 2);
        assert_eq!(parsed.mentions[0].agent_name, "Research Bot");
        assert_eq!(parsed.mentions[0].task_prompt, "find sources");
        assert_eq!(parsed.mentions[1].agent_index, 1);
        assert_eq!(parsed.mentions[1].task_prompt, "check them");
    }

    #[test]
    fn unique_model_id_resolves_but_shared_one_does_not() {
        let agents = vec![
            agent(0, None, "gpt-4o"),
            agent(1, None, "gpt-4o"),
            agent(2, None, "gemini-2.0-flash"),
        ];
        let parsed = parse_explicit("@gemini-2.0-flash describe it @gpt-4o hi", &agents);
        assert_eq!(parsed.mentions.len(), 1);
        assert_eq!(parsed.mentions[0].agent_index, 2);
        assert_eq!(parsed.mentions[0].task_prompt, "describe it");
        assert_eq!(parsed.invalid, vec!["@gpt-4o".to_string()]);
    }

    #[test]
    fn first_occurrence_wins_for_duplicate_targets() {
        let parsed = parse_mentions("@Agent1 first @1 second", &two_agents());
        assert_eq!(parsed.mentions.len(), 1);
        assert_eq!(parsed.mentions[0].task_prompt, "first");
    }

    #[test]
    fn unknown_mentions_are_reported() {
        let parsed = parse_explicit("@Bob please help @Agent2 go", &two_agents());
        assert_eq!(parsed.invalid, vec!["@Bob".to_string()]);
        assert_eq!(parsed.mentions.len(), 1);
    }

    #[test]
    fn empty_task_falls_back() {
        let agents = two_agents();
        let parsed = parse_mentions("@Agent1", &agents);
        assert_eq!(parsed.mentions[0].task_prompt, CONTINUE_PROMPT);

        let parsed = parse_mentions("Please refine the draft, @Agent2", &agents);
        assert_eq!(
            parsed.mentions[0].task_prompt,
            "Please refine the draft, @Agent2"
        );
    }

    #[test]
    fn inference_prefers_named_model() {
        let parsed = parse_mentions(
            "have claude-3-5-sonnet-latest look at the numbers",
            &two_agents(),
        );
        assert_eq!(parsed.mentions.len(), 1);
        assert_eq!(parsed.mentions[0].agent_index, 1);
        assert_eq!(
            parsed.mentions[0].task_prompt,
            "have claude-3-5-sonnet-latest look at the numbers"
        );
    }

    #[test]
    fn inference_by_capability_keyword() {
        let agents = vec![
            agent(0, None, "gemini-2.0-flash"),
            agent(1, None, "deepseek-chat"),
        ];
        let parsed = parse_mentions("Can someone debug this code?", &agents);
        assert_eq!(parsed.mentions[0].agent_index, 1);

        let parsed = parse_mentions("What is in this picture", &agents);
        assert_eq!(parsed.mentions[0].agent_index, 0);

        assert!(parse_mentions("hello there", &agents).mentions.is_empty());
    }
}
