use std::fmt;

/// A single SCPI command line, without terminator.
///
/// Whether the instrument answers is decided by a fixed rule on the command header
/// rather than stored per call site: a header ending in `?` is a query and gets
/// exactly one response line, anything else is fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    expects_response: bool,
}

impl Command {
    /// Build a command, classifying it by its header.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let expects_response = is_query(&text);
        Self {
            text,
            expects_response,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expects_response(&self) -> bool {
        self.expects_response
    }

    /// Header token (everything before the first space).
    pub fn header(&self) -> &str {
        self.text.split_whitespace().next().unwrap_or("")
    }
}

fn is_query(text: &str) -> bool {
    text.split_whitespace()
        .next()
        .is_some_and(|header| header.ends_with('?'))
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Command::new(text)
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Command::new(text)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
