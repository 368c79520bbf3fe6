//! Rolling transcript window for UI display.
//!
//! The remote emits transcript fragments as it speaks; the UI shows only the
//! last few. Fragments are scrubbed of markdown artifacts the voice model
//! sometimes leaks into its spoken-text channel.

use std::collections::VecDeque;

/// Default number of fragments retained for display.
pub const DEFAULT_WINDOW: usize = 4;

/// Keeps the last N transcript fragments.
#[derive(Debug)]
pub struct TranscriptWindow {
    fragments: VecDeque<String>,
    capacity: usize,
}

impl Default for TranscriptWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl TranscriptWindow {
    /// Create a window retaining `capacity` fragments.
    pub fn new(capacity: usize) -> Self {
        Self {
            fragments: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Push a fragment, cleaning it for display and evicting the oldest
    /// entry when full. Empty fragments (after cleaning) are ignored.
    pub fn push(&mut self, fragment: &str) {
        let cleaned = clean_for_display(fragment);
        if cleaned.is_empty() {
            return;
        }
        if self.fragments.len() == self.capacity {
            self.fragments.pop_front();
        }
        self.fragments.push_back(cleaned);
    }

    /// The retained fragments, oldest first.
    pub fn fragments(&self) -> Vec<String> {
        self.fragments.iter().cloned().collect()
    }

    /// Drop all fragments.
    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}

/// Strip markdown emphasis and heading artifacts from a spoken-text
/// fragment and collapse whitespace.
pub fn clean_for_display(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '*' | '#' | '`' => {}
            c if c.is_whitespace() => {
                if !out.ends_with(' ') && !out.is_empty() {
                    out.push(' ');
                }
            }
            c => out.push(c),
        }
    }
    out.trim_end().to_owned()
}
