// Sanitization utilities
// Keeps host internals (absolute paths, native frames) out of anything that is
// handed back to a caller.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref HOST_PATH_REGEX: Option<Regex> =
        Regex::new(r"(?:[A-Za-z]:\\|/)(?:[\w.\-]+[/\\])+[\w.\-]+(?::\d+)*").ok();
    static ref NATIVE_FRAME_REGEX: Option<Regex> =
        Regex::new(r"(?i)\bat\s+(?:<native>|native|\S+\.rs\b)").ok();
}

/// Default cap on a sanitized message, in characters
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 2048;

/// Sanitizer for error messages and stacks leaving the engine
#[derive(Debug, Clone)]
pub struct MessageSanitizer {
    max_message_chars: usize,
    max_stack_frames: usize,
}

impl Default for MessageSanitizer {
    fn default() -> Self {
        Self {
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            max_stack_frames: 16,
        }
    }
}

impl MessageSanitizer {
    pub fn new(max_message_chars: usize, max_stack_frames: usize) -> Self {
        Self {
            max_message_chars,
            max_stack_frames,
        }
    }

    /// Replace host paths and cap the length.
    pub fn sanitize_message(&self, message: &str) -> String {
        let scrubbed = match HOST_PATH_REGEX.as_ref() {
            Some(regex) => regex.replace_all(message, "<host>").into_owned(),
            None => message.to_string(),
        };
        truncate_chars(&scrubbed, self.max_message_chars)
    }

    /// Drop native frames, scrub paths in the remaining ones and keep at
    /// most `max_stack_frames` lines. Returns `None` when nothing is left.
    pub fn sanitize_stack(&self, stack: &str) -> Option<String> {
        let frames: Vec<String> = stack
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .filter(|line| {
                NATIVE_FRAME_REGEX
                    .as_ref()
                    .map_or(true, |regex| !regex.is_match(line))
            })
            .take(self.max_stack_frames)
            .map(|line| self.sanitize_message(line))
            .collect();

        if frames.is_empty() {
            None
        } else {
            Some(frames.join("\n"))
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => {
            let mut truncated = text.get(..byte_index).unwrap_or(text).to_string();
            truncated.push_str("...");
            truncated
        }
        None => text.to_string(),
    }
}
