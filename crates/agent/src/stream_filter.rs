//! Incremental classification of streamed output into plain text and
//! tool-call envelopes.
//!
//! Text is only recognized as a tool call once the opening delimiter has
//! fully arrived, so output that could still turn into one is held back.
//! At most `CALL_OPEN.len()` bytes are delayed this way.

use crate::envelope::CALL_OPEN;

/// How a streamed turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEnd {
    /// Plain text. Carries any held-back tail still owed to the consumer.
    Finished(String),
    /// A tool call was accumulated. Carries everything streamed this turn.
    ToolCall(String),
}

#[derive(Debug, Default)]
pub struct StreamingToolFilter {
    /// Text not yet classified
    pending: String,
    /// Everything inserted since the turn started
    cumulative: String,
    accumulating: bool,
    end_marker: Option<String>,
}

impl StreamingToolFilter {
    pub fn new(end_marker: Option<String>) -> Self {
        Self {
            end_marker,
            ..Self::default()
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.accumulating
    }

    /// Feed one inserted fragment. Returns the text to hand to the consumer.
    pub fn on_insert(&mut self, fragment: &str) -> Option<String> {
        self.cumulative.push_str(fragment);
        if self.accumulating {
            return None;
        }
        self.pending.push_str(fragment);

        let head = self.pending.trim_start();
        if head.starts_with(CALL_OPEN) {
            self.accumulating = true;
            return None;
        }
        if CALL_OPEN.starts_with(head) {
            return None;
        }

        let text = std::mem::take(&mut self.pending);
        if self.end_marker.as_deref() == Some(text.as_str()) {
            return None;
        }
        Some(text)
    }

    /// The observed output was reset: the turn is over. Resets the filter.
    pub fn on_turn_end(&mut self) -> TurnEnd {
        let pending = std::mem::take(&mut self.pending);
        let cumulative = std::mem::take(&mut self.cumulative);
        if std::mem::take(&mut self.accumulating) {
            return TurnEnd::ToolCall(cumulative);
        }
        match self.end_marker.as_deref() {
            Some(marker) => TurnEnd::Finished(pending.trim_end_matches(marker).to_string()),
            None => TurnEnd::Finished(pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(filter: &mut StreamingToolFilter, fragments: &[&str]) -> String {
        fragments
            .iter()
            .filter_map(|f| filter.on_insert(f))
            .collect()
    }

    #[test]
    fn plain_text_passes_straight_through() {
        let mut filter = StreamingToolFilter::default();
        assert_eq!(filter.on_insert("Hello"), Some("Hello".into()));
        assert_eq!(filter.on_insert(", world"), Some(", world".into()));
        assert_eq!(filter.on_turn_end(), TurnEnd::Finished(String::new()));
    }

    #[test]
    fn tool_call_after_text_is_withheld() {
        let mut filter = StreamingToolFilter::default();
        let shown = feed(
            &mut filter,
            &[
                "Paris",
                "\n\n<tool_call>{\"name\":\"sum\"}",
                "</tool_call>",
            ],
        );
        assert_eq!(shown, "Paris");
        assert!(filter.is_accumulating());
        match filter.on_turn_end() {
            TurnEnd::ToolCall(buffer) => {
                assert!(buffer.starts_with("Paris"));
                assert!(buffer.ends_with("</tool_call>"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!filter.is_accumulating());
    }

    #[test]
    fn delimiter_split_across_fragments_is_detected() {
        let mut filter = StreamingToolFilter::default();
        let shown = feed(&mut filter, &["\n", "<tool", "_ca", "ll>{}", "</tool_call>"]);
        assert!(shown.is_empty());
        assert!(matches!(filter.on_turn_end(), TurnEnd::ToolCall(_)));
    }

    #[test]
    fn false_alarm_releases_held_text() {
        let mut filter = StreamingToolFilter::default();
        assert_eq!(filter.on_insert("<to"), None);
        assert_eq!(filter.on_insert("day>"), Some("<today>".into()));
    }

    #[test]
    fn held_tail_is_returned_at_turn_end() {
        let mut filter = StreamingToolFilter::default();
        assert_eq!(filter.on_insert("done"), Some("done".into()));
        assert_eq!(filter.on_insert("\n"), None);
        assert_eq!(filter.on_turn_end(), TurnEnd::Finished("\n".into()));
    }

    #[test]
    fn end_marker_is_swallowed() {
        let mut filter = StreamingToolFilter::new(Some("<|im_end|>".into()));
        assert_eq!(filter.on_insert("Hi"), Some("Hi".into()));
        assert_eq!(filter.on_insert("<|im_end|>"), None);
        assert_eq!(filter.on_turn_end(), TurnEnd::Finished(String::new()));
    }
}
