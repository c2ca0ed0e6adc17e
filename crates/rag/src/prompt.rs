//! Builds the bounded message list sent to the chat model.

use crate::context::token::estimate_messages_tokens;
use crate::context::{ContextBundle, Section, SectionKind};
use nestling_core::chat::ChatTurn;
use nestling_core::message::Message;
use tracing::debug;

pub const SYSTEM_DIRECTIVE: &str = "\
You are a parenting assistant helping caregivers with clear, supportive and accurate guidance.
Answer using the context below together with established child-development knowledge.

Guidelines:
1. Prefer facts from the context; if it does not cover the question, say so and give general advice.
2. Be warm and never judgmental.
3. For anything medical, recommend talking to a pediatrician or other healthcare professional.
4. Tailor advice to the child's age when it is known.
5. Keep answers short and practical.";

const NO_CHILD_CONTEXT: &str = "No specific child information provided.";

/// The composed request body plus what made it in.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedPrompt {
    pub messages: Vec<Message>,
    /// Document ids of the detail and knowledge items left in the prompt.
    pub citations: Vec<String>,
    pub history_dropped: usize,
    pub sections_dropped: Vec<SectionKind>,
    pub tokens: usize,
}

#[derive(Debug, Clone)]
pub struct PromptComposer {
    directive: String,
    max_prompt_tokens: usize,
}

impl PromptComposer {
    pub fn new(max_prompt_tokens: usize) -> Self {
        Self {
            directive: SYSTEM_DIRECTIVE.to_string(),
            max_prompt_tokens,
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }

    /// Compose system directive, context, history (oldest first) and the
    /// question. Over budget, the oldest turns go first, then context
    /// sections from lowest priority up. The profile and the question are
    /// always kept.
    pub fn compose(&self, context: &ContextBundle, history: &[ChatTurn], question: &str) -> ComposedPrompt {
        let mut sections = context.sections();
        let mut turns = history;
        let mut sections_dropped = Vec::new();

        let (messages, tokens) = loop {
            let messages = self.build(&sections, turns, question);
            let tokens = estimate_messages_tokens(&messages);
            if tokens <= self.max_prompt_tokens {
                break (messages, tokens);
            }
            if let Some((_, rest)) = turns.split_first() {
                turns = rest;
                continue;
            }
            match sections.iter().rposition(|s| s.kind != SectionKind::Profile) {
                Some(idx) => sections_dropped.push(sections.remove(idx).kind),
                None => break (messages, tokens),
            }
        };

        let history_dropped = history.len() - turns.len();
        if history_dropped > 0 || !sections_dropped.is_empty() {
            debug!(
                history_dropped,
                sections_dropped = ?sections_dropped,
                tokens,
                budget = self.max_prompt_tokens,
                "Prompt trimmed to budget"
            );
        }

        let kept = |kind: SectionKind| sections.iter().any(|s| s.kind == kind);
        let mut citations = Vec::new();
        if kept(SectionKind::Details) {
            citations.extend(context.details.iter().map(|i| i.document_id.clone()));
        }
        if kept(SectionKind::Knowledge) {
            citations.extend(context.knowledge.iter().map(|i| i.document_id.clone()));
        }

        ComposedPrompt {
            messages,
            citations,
            history_dropped,
            sections_dropped,
            tokens,
        }
    }

    fn build(&self, sections: &[Section], turns: &[ChatTurn], question: &str) -> Vec<Message> {
        let context = if sections.is_empty() {
            format!("Child information: {NO_CHILD_CONTEXT}")
        } else {
            let body: Vec<&str> = sections.iter().map(|s| s.text.as_str()).collect();
            format!("Context:\n{}", body.join("\n"))
        };

        let mut messages = Vec::with_capacity(turns.len() * 2 + 2);
        messages.push(Message::system(format!("{}\n\n{}", self.directive, context)));
        for turn in turns {
            messages.push(Message::user(turn.question.clone()));
            messages.push(Message::assistant(turn.answer.clone()));
        }
        messages.push(Message::user(question));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextItem, ProfileSnippet, RecordLine};
    use chrono::Utc;
    use nestling_core::chat::SessionId;
    use nestling_core::child::UserId;
    use nestling_core::message::Role;

    fn bundle() -> ContextBundle {
        ContextBundle {
            profile: Some(ProfileSnippet {
                name: "Mia".into(),
                age_days: 400,
                age_months: 13,
                age_years: 1,
                gender: None,
            }),
            details: vec![ContextItem {
                document_id: "d1".into(),
                text: "Child Detail - Type: interest\nContent: enjoys stacking blocks into towers".into(),
                score: 0.9,
                importance: 8,
            }],
            knowledge: vec![ContextItem {
                document_id: "k1".into(),
                text: "Stacking toys build fine motor skills. ".repeat(10),
                score: 0.4,
                importance: 0,
            }],
            records: vec![RecordLine {
                category: "sleep".into(),
                value: serde_json::json!("11h"),
                notes: None,
                recorded_at: Utc::now(),
            }],
            ..Default::default()
        }
    }

    fn turns(n: u64) -> Vec<ChatTurn> {
        (1..=n)
            .map(|i| ChatTurn {
                session_id: SessionId::from("s"),
                sequence: i,
                user_id: UserId::new(),
                child_id: None,
                question: format!("earlier question number {i} about naps and bedtime"),
                answer: format!("earlier answer number {i} with some detail about routines"),
                model: "m".into(),
                sources: vec![],
                created_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn layout_is_system_history_question() {
        let composer = PromptComposer::new(10_000);
        let prompt = composer.compose(&bundle(), &turns(2), "What toys?");
        let roles: Vec<Role> = prompt.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
        assert!(prompt.messages[0].content.starts_with(SYSTEM_DIRECTIVE));
        assert!(prompt.messages[0].content.contains("[Child Profile]"));
        assert_eq!(prompt.messages.last().unwrap().content, "What toys?");
        assert_eq!(prompt.citations, vec!["d1", "k1"]);
    }

    #[test]
    fn identical_inputs_compose_identically() {
        let composer = PromptComposer::new(10_000);
        let ctx = bundle();
        let history = turns(3);
        assert_eq!(
            composer.compose(&ctx, &history, "q"),
            composer.compose(&ctx, &history, "q")
        );
    }

    #[test]
    fn history_goes_before_context() {
        let composer = PromptComposer::new(10_000);
        let full = composer.compose(&bundle(), &turns(0), "q").tokens;
        let composer = PromptComposer::new(full + 30);
        let prompt = composer.compose(&bundle(), &turns(4), "q");
        assert!(prompt.history_dropped >= 3);
        assert!(prompt.sections_dropped.is_empty());
        assert!(prompt.tokens <= full + 30);
    }

    #[test]
    fn sections_drop_lowest_priority_first() {
        let composer = PromptComposer::new(10_000);
        let without_knowledge = {
            let mut ctx = bundle();
            ctx.knowledge.clear();
            ctx.records.clear();
            composer.compose(&ctx, &[], "q").tokens
        };
        let composer = PromptComposer::new(without_knowledge);
        let prompt = composer.compose(&bundle(), &turns(1), "q");
        assert_eq!(prompt.history_dropped, 1);
        assert_eq!(prompt.sections_dropped, vec![SectionKind::Records, SectionKind::Knowledge]);
        assert_eq!(prompt.citations, vec!["d1"]);
        assert!(prompt.messages[0].content.contains("[Child Profile]"));
    }

    #[test]
    fn empty_context_notes_missing_child() {
        let prompt = PromptComposer::new(1_000).compose(&ContextBundle::default(), &[], "q");
        assert!(prompt.messages[0].content.ends_with(NO_CHILD_CONTEXT));
        assert!(prompt.citations.is_empty());
    }
}
