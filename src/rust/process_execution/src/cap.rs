//! Per-stream output byte cap.
//!
//! Once a stream has produced more than `max_bytes` of decoded text, the retained prefix is
//! capped at `max_bytes` with its final 15 bytes overwritten by the truncation marker — and the
//! counter that tracks how much the program actually produced keeps incrementing regardless, but
//! nothing past the cap is retained or emitted. The stream itself is never closed early because
//! of the cap; only its content is bounded.
//!
//! Because `run_stream` emits chunks live, the cap can't simply wait until the end to decide
//! whether to splice in the marker: by the time truncation is confirmed, the bytes the marker
//! would overwrite may already have been handed to the caller. So `OutputCap` always holds back
//! the trailing `TRUNCATION_MARKER` bytes of whatever it has seen, releasing them only once it
//! is safe to do so — either because the stream ended without crossing the cap (`finish`), or
//! immediately once the cap is crossed, at which point the held-back bytes are discarded and the
//! marker is emitted in their place. This keeps `run` (which folds every chunk into one buffer)
//! and `run_stream` (which forwards chunks as they're admitted) byte-identical.

const MARKER: &str = sandbox_types::TRUNCATION_MARKER;

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Tracks how much of one output stream has been admitted against a byte cap, holding back the
/// trailing bytes that might still need to be replaced by the truncation marker.
#[derive(Debug, Clone)]
pub struct OutputCap {
    max_bytes: usize,
    /// Bytes of the underlying (uncapped) stream already released to the caller.
    committed: usize,
    /// Total bytes of the underlying stream observed so far, used to detect crossing the cap.
    seen: usize,
    /// The trailing up-to-`MARKER.len()` bytes seen so far, held back until it's known whether
    /// they'll survive untouched or be overwritten by the marker.
    held: String,
    truncated: bool,
}

impl OutputCap {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            committed: 0,
            seen: 0,
            held: String::new(),
            truncated: false,
        }
    }

    /// Feeds `text` into the cap, returning the bytes now safe to emit: either a plain extension
    /// of what's already been released, or — the moment the cap is first crossed — the final
    /// capped prefix with the marker already appended. Every byte of `text` counts against the
    /// running total regardless of whether it is returned. Once truncated, always returns empty.
    pub fn admit(&mut self, text: &str) -> String {
        if self.truncated {
            return String::new();
        }

        let mut combined = std::mem::take(&mut self.held);
        combined.push_str(text);
        self.seen += text.len();

        if self.seen <= self.max_bytes {
            let split = floor_char_boundary(&combined, combined.len().saturating_sub(MARKER.len()));
            let release = combined[..split].to_string();
            self.held = combined[split..].to_string();
            self.committed += release.len();
            release
        } else {
            self.truncated = true;
            self.held.clear();
            let keep_len = self.max_bytes.saturating_sub(MARKER.len());
            let additional = floor_char_boundary(&combined, keep_len.saturating_sub(self.committed).min(combined.len()));
            let mut out = combined[..additional].to_string();
            out.push_str(MARKER);
            out
        }
    }

    /// Releases any still-held-back tail once the stream has ended without crossing the cap.
    /// A no-op (returns empty) if the cap was crossed — the marker already replaced the tail.
    pub fn finish(&mut self) -> String {
        if self.truncated {
            return String::new();
        }
        std::mem::take(&mut self.held)
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_everything_under_the_cap_once_finished() {
        let mut cap = OutputCap::new(100);
        let mut out = cap.admit("hello");
        out.push_str(&cap.finish());
        assert_eq!(out, "hello");
        assert!(!cap.truncated());
    }

    #[test]
    fn holds_back_a_small_tail_until_finish() {
        // With a cap this much larger than the marker, everything but the last few bytes is
        // released immediately; `finish` releases the remainder once the stream is known to
        // have stayed under the cap.
        let mut cap = OutputCap::new(1_000);
        let released = cap.admit("hello world");
        assert!("hello world".starts_with(&released));
        let mut out = released;
        out.push_str(&cap.finish());
        assert_eq!(out, "hello world");
    }

    #[test]
    fn truncates_and_embeds_the_marker_as_soon_as_the_cap_is_crossed() {
        let mut cap = OutputCap::new(20);
        let mut out = cap.admit(&"x".repeat(10));
        out.push_str(&cap.admit(&"y".repeat(20)));
        assert!(cap.truncated());
        assert_eq!(out.len(), 20);
        assert!(out.ends_with("\n...[truncated]"));
        // Further chunks (and `finish`) contribute nothing further.
        assert_eq!(cap.admit("more"), "");
        assert_eq!(cap.finish(), "");
    }

    #[test]
    fn splits_at_a_char_boundary_when_truncating() {
        let mut cap = OutputCap::new(20);
        // 'é' is 2 bytes; make sure the cut point lands cleanly regardless.
        let mut out = cap.admit(&"aébcdef".repeat(5));
        out.push_str(&cap.admit("more text past the cap"));
        assert!(cap.truncated());
        assert_eq!(out.len(), 20);
        assert!(out.ends_with("\n...[truncated]"));
        assert!(std::str::from_utf8(out.as_bytes()).is_ok());
    }

    #[test]
    fn exactly_at_the_cap_is_not_truncated() {
        let mut cap = OutputCap::new(5);
        let mut out = cap.admit("hello");
        out.push_str(&cap.finish());
        assert_eq!(out, "hello");
        assert!(!cap.truncated());
    }
}
