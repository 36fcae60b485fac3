//! Channel and group name validation, plus glob patterns over channel names.
//!
//! Channel names are ASCII alphanumerics, hyphens, underscores and periods,
//! optionally followed by `!` and a process-local suffix
//! (e.g. `websocket.send!a1b2c3`). Group names use the same alphabet without
//! the `!` section. Both must be shorter than [`NAME_LENGTH_LIMIT`] bytes.

use std::sync::LazyLock;

use regex::Regex;

use crate::layer::ChannelLayerError;

/// Exclusive upper bound on the length of a channel or group name, in bytes.
pub const NAME_LENGTH_LIMIT: usize = 100;

static CHANNEL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z\d\-_.]+(![\d\w\-_.]*)?$").expect("channel name regex is valid")
});

static GROUP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z\d\-_.]+$").expect("group name regex is valid"));

/// Validates a channel name.
///
/// With `receive` set, process-specific names must end at the `!`: a worker
/// receives on `websocket.send!`, never on one concrete `websocket.send!abc`.
///
/// # Errors
///
/// Returns `ChannelLayerError::InvalidChannelName` if the name is too long,
/// contains characters outside the allowed alphabet, or (when receiving)
/// names a concrete process-local channel.
pub fn validate_channel_name(name: &str, receive: bool) -> Result<(), ChannelLayerError> {
    let valid = name.len() < NAME_LENGTH_LIMIT
        && CHANNEL_NAME.is_match(name)
        && !(receive && name.contains('!') && !name.ends_with('!'));
    if valid {
        Ok(())
    } else {
        Err(ChannelLayerError::InvalidChannelName {
            name: name.to_string(),
        })
    }
}

/// Validates a group name.
///
/// # Errors
///
/// Returns `ChannelLayerError::InvalidGroupName` for names that are too long
/// or contain characters outside `[a-zA-Z0-9-_.]`.
pub fn validate_group_name(name: &str) -> Result<(), ChannelLayerError> {
    if name.len() < NAME_LENGTH_LIMIT && GROUP_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ChannelLayerError::InvalidGroupName {
            name: name.to_string(),
        })
    }
}

/// Returns the non-local part of a channel name: up to and including the `!`
/// for process-specific channels, the whole name otherwise.
#[must_use]
pub fn non_local_name(name: &str) -> &str {
    match name.find('!') {
        Some(idx) => &name[..=idx],
        None => name,
    }
}

// ---------------------------------------------------------------------------
// Glob patterns
// ---------------------------------------------------------------------------

/// Translates a shell-style glob into an anchored regular expression.
///
/// `*` matches any run of characters, `?` a single character, and `[...]`
/// a character class (`[!...]` negates). Everything else matches literally.
#[must_use]
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' {
                        class.push('\\');
                    }
                    class.push(inner);
                }
                if closed {
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                } else {
                    // Unterminated class: match the bracket text literally.
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(class.trim_start_matches('^')));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// A compiled glob pattern over channel names.
#[derive(Debug, Clone)]
pub struct ChannelPattern {
    glob: String,
    regex: Regex,
}

impl ChannelPattern {
    /// Compiles a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns the underlying `regex::Error` if the translated pattern does
    /// not compile (e.g. an inverted character range).
    pub fn new(glob: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            glob: glob.to_string(),
            regex: Regex::new(&glob_to_regex(glob))?,
        })
    }

    /// The glob this pattern was compiled from.
    #[must_use]
    pub fn glob(&self) -> &str {
        &self.glob
    }

    /// Whether `name` matches the pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}
