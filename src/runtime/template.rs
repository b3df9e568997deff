//! ChatML prompt builders for the docent conversation
//!
//! Both builders are total: any input renders, nothing can fail.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::constants::chatml::{IM_END, IM_START};

/// Artwork fields rendered into the system turn. Empty fields are skipped.
///
/// `school` is carried for the host but not rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtworkMetadata {
    pub title: String,
    pub author: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub technique: String,
    pub school: String,
    pub date: String,
    pub description: String,
}

impl ArtworkMetadata {
    /// Labelled fields in render order
    fn fields(&self) -> [(&'static str, &str); 6] {
        [
            ("Title", self.title.as_str()),
            ("Object Date", self.date.as_str()),
            ("Artist Display Name", self.author.as_str()),
            ("Medium", self.technique.as_str()),
            ("Type", self.kind.as_str()),
            ("Description", self.description.as_str()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, v)| v.trim().is_empty()) && self.school.trim().is_empty()
    }
}

/// Render the fixed system turn.
pub fn format_fixed_prefix(metadata: &ArtworkMetadata) -> String {
    let mut prompt = String::with_capacity(256);
    prompt.push_str(IM_START);
    prompt.push_str("system\n[ARTWORK INFO]\n\n");
    for (label, value) in metadata.fields() {
        let value = value.trim();
        if !value.is_empty() {
            // writing into a String cannot fail
            let _ = writeln!(prompt, "{}: {}", label, value);
        }
    }
    prompt.push('\n');
    prompt.push_str(IM_END);
    prompt.push('\n');
    prompt
}

/// Render a user turn followed by an open assistant turn.
pub fn format_user_turn(question: &str) -> String {
    let mut prompt = String::with_capacity(question.len() + 64);
    prompt.push_str(IM_START);
    prompt.push_str("user\n[QUESTION]\n\n");
    prompt.push_str(question);
    prompt.push('\n');
    prompt.push_str(IM_END);
    prompt.push('\n');
    prompt.push_str(IM_START);
    prompt.push_str("assistant");
    prompt
}

/// Markers that indicate the model started a new turn on its own.
pub fn default_stop_sequences() -> Vec<String> {
    vec![IM_START.to_string(), IM_END.to_string()]
}
