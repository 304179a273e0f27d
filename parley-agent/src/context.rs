//! Context builder for assembling prompts

use parley_core::session::ChatMessage;
use parley_providers::Message;

/// Builds the message list sent to the provider
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    system_prompt: String,
    history_turns: usize,
}

impl ContextBuilder {
    pub fn new(system_prompt: impl Into<String>, history_turns: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history_turns,
        }
    }

    pub fn history_turns(&self) -> usize {
        self.history_turns
    }

    /// System prompt, personalised when the visitor gave a name
    pub fn build_system_prompt(&self, visitor_name: Option<&str>) -> String {
        match visitor_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => format!("{}\n\nThe visitor's name is {}.", self.system_prompt, name),
            None => self.system_prompt.clone(),
        }
    }

    /// Build the complete message list for a provider call.
    ///
    /// Only the most recent `history_turns` history messages are kept, so
    /// request size stays bounded however long the session runs.
    pub fn build_messages(
        &self,
        history: &[ChatMessage],
        current_message: &str,
        visitor_name: Option<&str>,
    ) -> Vec<Message> {
        let start = history.len().saturating_sub(self.history_turns);
        let mut messages = Vec::with_capacity(history.len() - start + 2);

        messages.push(Message::system(self.build_system_prompt(visitor_name)));

        for msg in &history[start..] {
            let message = match msg.role.as_str() {
                "user" => Message::user(&msg.content),
                "assistant" => Message::assistant(&msg.content),
                _ => continue,
            };
            messages.push(message);
        }

        messages.push(Message::user(current_message));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                ChatMessage::new(role, format!("m{}", i))
            })
            .collect()
    }

    #[test]
    fn test_build_messages_layout() {
        let builder = ContextBuilder::new("be brief", 12);
        let messages = builder.build_messages(&history(2), "next?", None);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[1].content, "m0");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3], Message::user("next?"));
    }

    #[test]
    fn test_history_is_trimmed_to_most_recent_turns() {
        let builder = ContextBuilder::new("sys", 4);
        let messages = builder.build_messages(&history(10), "now", None);

        assert_eq!(messages.len(), 6);
        assert_eq!(messages[1].content, "m6");
        assert_eq!(messages[4].content, "m9");
    }

    #[test]
    fn test_unknown_roles_are_skipped() {
        let builder = ContextBuilder::new("sys", 12);
        let history = vec![ChatMessage::new("tool", "x"), ChatMessage::new("user", "y")];
        let messages = builder.build_messages(&history, "z", None);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "y");
    }

    #[test]
    fn test_visitor_name_in_system_prompt() {
        let builder = ContextBuilder::new("sys", 12);
        assert!(builder
            .build_system_prompt(Some("Mina"))
            .ends_with("The visitor's name is Mina."));
        assert_eq!(builder.build_system_prompt(Some("  ")), "sys");
    }
}
