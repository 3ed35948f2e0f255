//! Streaming citation rewriter.
//!
//! Answer text arrives in arbitrary fragments. [`CitationStream`] rewrites
//! `[citation:N]` and `(citation:N)` markers into display ordinals while the
//! text is still streaming. Only the last [`MAX_LOOKAHEAD`] characters are
//! held back after each push, which is enough to hold any marker that has
//! started but not yet been closed.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use sage_core::Reference;

/// Either bracket style opens or closes a marker, mixed pairs included.
static CITATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\[(]citation:([0-9]{1,9})[\])]").expect("Invalid citation regex")
});

/// Longest marker the pattern can match.
const LONGEST_MARKER: usize = "[citation:999999999]".len();

/// Characters withheld from output after each push.
pub const MAX_LOOKAHEAD: usize = 3 * LONGEST_MARKER;

/// Formats a display ordinal as `[n]`.
pub fn bracket_cite(ordinal: usize) -> String {
    format!("[{}]", ordinal)
}

// =============================================================================
// CitationStream
// =============================================================================

/// Incremental rewriter for one answer stream.
///
/// Every character pushed reaches `print` exactly once, in order, after
/// markers have been replaced. A rewritten marker is always printed in a
/// single call.
pub struct CitationStream<P: FnMut(&str)> {
    buffer: String,
    refs: Vec<u32>,
    print: P,
    cite: fn(usize) -> String,
}

impl<P: FnMut(&str)> CitationStream<P> {
    pub fn new(print: P) -> Self {
        Self {
            buffer: String::new(),
            refs: Vec::new(),
            print,
            cite: bracket_cite,
        }
    }

    /// Use a different ordinal formatter.
    pub fn with_cite(mut self, cite: fn(usize) -> String) -> Self {
        self.cite = cite;
        self
    }

    /// Citation numbers seen so far, in first-seen order.
    pub fn refs(&self) -> &[u32] {
        &self.refs
    }

    /// Feed one fragment and print everything that can no longer change.
    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        self.rewrite_complete();

        let held = self.buffer.chars().count();
        if held > MAX_LOOKAHEAD {
            let cut = self
                .buffer
                .char_indices()
                .nth(held - MAX_LOOKAHEAD)
                .map(|(idx, _)| idx)
                .unwrap_or(self.buffer.len());
            let head: String = self.buffer.drain(..cut).collect();
            self.emit(&head);
        }
    }

    /// Print whatever is held back and return the refs; the stream is
    /// empty afterwards.
    pub fn flush(&mut self) -> Vec<u32> {
        self.rewrite_complete();
        let rest = std::mem::take(&mut self.buffer);
        self.emit(&rest);
        std::mem::take(&mut self.refs)
    }

    /// Print and drop every complete marker in the buffer, along with the
    /// text in front of it.
    fn rewrite_complete(&mut self) {
        while let Some(caps) = CITATION.captures(&self.buffer) {
            let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let (start, end) = (whole.start(), whole.end());
            // Nine digits always fit.
            let n = number.as_str().parse::<u32>().unwrap_or(u32::MAX);

            let prefix = self.buffer[..start].to_string();
            self.buffer.drain(..end);

            let ordinal = self.ordinal(n);
            self.emit(&prefix);
            let marker = (self.cite)(ordinal);
            self.emit(&marker);
        }
    }

    fn ordinal(&mut self, n: u32) -> usize {
        match self.refs.iter().position(|&r| r == n) {
            Some(idx) => idx + 1,
            None => {
                self.refs.push(n);
                self.refs.len()
            }
        }
    }

    fn emit(&mut self, text: &str) {
        if !text.is_empty() {
            (self.print)(text);
        }
    }
}

// =============================================================================
// One-shot helpers
// =============================================================================

/// Rewrite a complete text; returns the display text and first-seen refs.
pub fn rewrite(text: &str) -> (String, Vec<u32>) {
    let mut out = String::with_capacity(text.len());
    let refs = {
        let mut stream = CitationStream::new(|s: &str| out.push_str(s));
        stream.push(text);
        stream.flush()
    };
    (out, refs)
}

/// A reference together with the ordinal it is displayed under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CitedReference {
    pub ordinal: usize,
    #[serde(flatten)]
    pub reference: Reference,
}

/// Resolve refs against the references the answer was built from.
///
/// Refs naming a position that does not exist are dropped; ordinals of the
/// remaining refs are left as displayed.
pub fn cited_references(refs: &[u32], references: &[Reference]) -> Vec<CitedReference> {
    refs.iter()
        .enumerate()
        .filter_map(|(idx, &n)| {
            references
                .iter()
                .find(|r| r.position as u64 == n as u64)
                .map(|r| CitedReference {
                    ordinal: idx + 1,
                    reference: r.clone(),
                })
        })
        .collect()
}
