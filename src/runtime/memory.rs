//! Working memory: the per-cell bounded conversation log.
//!
//! A sliding window keeps the newest messages, pinned entries survive
//! eviction, oversized tool results are compressed on the way in, and an
//! optional summarizer folds the oldest messages into one system note.

use crate::domain::errors::MindError;
use crate::domain::models::{ChatMessage, ContentBlock, MemorySpec, Role, ThinkRequest};
use crate::domain::ports::Mind;

/// Tool-result strings longer than this are truncated.
const TOOL_RESULT_LIMIT: usize = 2000;
const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Prefix of the summary note inserted by the summarizer.
pub const SUMMARY_PREFIX: &str = "[Summary of earlier conversation] ";

struct Entry {
    message: ChatMessage,
    pinned: bool,
}

pub struct WorkingMemory {
    entries: Vec<Entry>,
    max_messages: usize,
    summarize_after: Option<usize>,
    summarized: bool,
}

impl WorkingMemory {
    pub fn new(spec: &MemorySpec) -> Self {
        Self {
            entries: Vec::new(),
            max_messages: spec.max_messages.max(1),
            summarize_after: spec.summarize_after,
            summarized: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn was_summarized(&self) -> bool {
        self.summarized
    }

    /// Append a message, evicting the oldest non-pinned entries once the
    /// window overflows.
    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push(Entry { message, pinned: false });

        while self.entries.len() > self.max_messages {
            let Some(victim) = self.entries.iter().position(|e| !e.pinned) else {
                break; // everything pinned; let the window grow
            };
            self.entries.remove(victim);
        }
    }

    /// Append `text` as a plain message from `role`.
    pub fn push_text(&mut self, role: Role, text: impl Into<String>) {
        self.push(ChatMessage::text(role, text));
    }

    /// Append one user message carrying a batch of tool results, each
    /// compressed to the size limit.
    pub fn push_tool_results(&mut self, results: Vec<(String, String, bool)>) {
        let content = results
            .into_iter()
            .map(|(tool_use_id, output, is_error)| ContentBlock::ToolResult {
                tool_use_id,
                content: compress_tool_result(&output),
                is_error,
            })
            .collect();
        self.push(ChatMessage { role: Role::User, content });
    }

    /// Pin the newest message so eviction and summarization skip it.
    pub fn pin_last(&mut self) {
        if let Some(entry) = self.entries.last_mut() {
            entry.pinned = true;
        }
    }

    /// Snapshot for a Mind call.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Summarization is due once the window holds `summarize_after` messages.
    pub fn needs_summary(&self) -> bool {
        self.summarize_after.is_some_and(|threshold| self.entries.len() >= threshold)
    }

    /// Replace the oldest non-pinned prefix with a single summary note
    /// produced by the Mind. Keeps at least the newest half of the window
    /// untouched so the active exchange survives.
    pub async fn summarize(&mut self, mind: &dyn Mind) -> Result<(), MindError> {
        let keep_recent = (self.max_messages / 2).max(1);
        let cutoff = self.entries.len().saturating_sub(keep_recent);

        let prefix_len = self
            .entries
            .iter()
            .take(cutoff)
            .take_while(|e| !e.pinned)
            .count();
        if prefix_len < 2 {
            return Ok(());
        }

        let transcript: String = self.entries[..prefix_len]
            .iter()
            .map(|e| format!("{:?}: {}\n", e.message.role, e.message.flat_text()))
            .collect();

        let request = ThinkRequest::new(vec![ChatMessage::text(
            Role::User,
            format!("Summarize this conversation concisely, keeping decisions and open tasks:\n\n{transcript}"),
        )])
        .with_system("You compress conversation history. Reply with the summary only.".to_string());

        let response = mind.think(request).await?;
        let summary = response.text();

        self.entries.splice(
            0..prefix_len,
            std::iter::once(Entry {
                message: ChatMessage::text(Role::System, format!("{SUMMARY_PREFIX}{summary}")),
                pinned: false,
            }),
        );
        self.summarized = true;
        Ok(())
    }
}

/// Truncate oversized tool output, appending the truncation marker.
pub fn compress_tool_result(output: &str) -> String {
    if output.len() <= TOOL_RESULT_LIMIT {
        return output.to_string();
    }
    let mut cut = TOOL_RESULT_LIMIT;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &output[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::minds::{MockMind, ScriptedTurn};

    fn spec(max: usize, summarize_after: Option<usize>) -> MemorySpec {
        MemorySpec { max_messages: max, summarize_after }
    }

    #[test]
    fn test_sliding_window_keeps_newest() {
        let mut memory = WorkingMemory::new(&spec(3, None));
        for i in 0..5 {
            memory.push_text(Role::User, format!("message {i}"));
        }

        assert_eq!(memory.len(), 3);
        let texts: Vec<String> = memory.messages().iter().map(ChatMessage::flat_text).collect();
        assert_eq!(texts, vec!["message 2", "message 3", "message 4"]);
    }

    #[test]
    fn test_pinned_messages_survive_eviction() {
        let mut memory = WorkingMemory::new(&spec(3, None));
        memory.push_text(Role::System, "important context");
        memory.pin_last();
        for i in 0..5 {
            memory.push_text(Role::User, format!("message {i}"));
        }

        let texts: Vec<String> = memory.messages().iter().map(ChatMessage::flat_text).collect();
        assert_eq!(texts[0], "important context");
        assert_eq!(texts.len(), 3);
    }

    #[test]
    fn test_tool_result_compression() {
        let long = "x".repeat(5000);
        let compressed = compress_tool_result(&long);
        assert!(compressed.len() < 2100);
        assert!(compressed.ends_with("[truncated]"));

        assert_eq!(compress_tool_result("short"), "short");
    }

    #[test]
    fn test_tool_results_land_in_one_user_message() {
        let mut memory = WorkingMemory::new(&spec(10, None));
        memory.push_tool_results(vec![
            ("tu_1".to_string(), "one".to_string(), false),
            ("tu_2".to_string(), "two".to_string(), true),
        ]);

        assert_eq!(memory.len(), 1);
        let message = &memory.messages()[0];
        assert_eq!(message.role, Role::User);
        assert_eq!(message.content.len(), 2);
    }

    #[test]
    fn test_needs_summary_threshold() {
        let mut memory = WorkingMemory::new(&spec(50, Some(3)));
        memory.push_text(Role::User, "one");
        memory.push_text(Role::Assistant, "two");
        assert!(!memory.needs_summary());
        memory.push_text(Role::User, "three");
        assert!(memory.needs_summary());
    }

    #[tokio::test]
    async fn test_summarize_replaces_prefix() {
        let mut memory = WorkingMemory::new(&spec(4, Some(4)));
        for i in 0..4 {
            memory.push_text(Role::User, format!("message {i}"));
        }

        let mind = MockMind::new(vec![ScriptedTurn::text("the gist")]);
        memory.summarize(mind.as_ref()).await.unwrap();

        assert!(memory.was_summarized());
        let texts: Vec<String> = memory.messages().iter().map(ChatMessage::flat_text).collect();
        assert_eq!(texts[0], format!("{SUMMARY_PREFIX}the gist"));
        // Prefix of two replaced by one summary; the recent tail intact.
        assert_eq!(texts.len(), 3);
        assert_eq!(texts[2], "message 3");
        assert_eq!(mind.call_count(), 1);
    }
}
