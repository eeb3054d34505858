//! Stop-sequence handling for generated text.
//!
//! Completions routinely run past the useful answer into chat-template
//! markers or a blank line. The helpers here locate the earliest
//! occurrence of any configured stop sequence and cut the text there.

/// Find the earliest occurrence of any stop sequence in `text`.
///
/// Returns the byte offset of the match closest to the start of the
/// text, regardless of the order the sequences are listed in.
pub fn find_stop_sequence(text: &str, stop_sequences: &[String]) -> Option<usize> {
    stop_sequences
        .iter()
        .filter_map(|stop| text.find(stop.as_str()))
        .min()
}

/// Truncate text at the earliest stop sequence, if any.
pub fn truncate_at_stop_sequence(text: &mut String, stop_sequences: &[String]) {
    if let Some(pos) = find_stop_sequence(text, stop_sequences) {
        text.truncate(pos);
    }
}

/// Strip surrounding whitespace, cut the completion at the earliest
/// stop sequence, then strip again.
///
/// The strip precedes the scan: a blank line at the very start of the
/// text is whitespace, not a sentinel, and the content after it stays.
pub fn trim_completion(text: &str, stop_sequences: &[String]) -> String {
    let mut out = text.trim().to_string();
    truncate_at_stop_sequence(&mut out, stop_sequences);
    out.trim().to_string()
}
