//! Shell quoting for commands relayed through a remote POSIX shell.

use std::borrow::Cow;

const SPECIAL_CHARS: &[char] = &[
    ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}', '<',
    '>', '|', '&', ';', '#', '~',
];

/// Whether an argument must be quoted to survive shell word splitting.
#[must_use]
pub fn needs_quoting(word: &str) -> bool {
    word.is_empty() || word.chars().any(|c| SPECIAL_CHARS.contains(&c))
}

/// Quotes a single word for a POSIX shell.
///
/// Plain words pass through unchanged; anything else is wrapped in single
/// quotes, with embedded single quotes spelled `'\''`.
#[must_use]
pub fn quote_word(word: &str) -> Cow<'_, str> {
    if !needs_quoting(word) {
        return Cow::Borrowed(word);
    }
    Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
}

/// Joins an argument vector into one shell-safe command string.
#[must_use]
pub fn join_words<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|word| quote_word(word.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
