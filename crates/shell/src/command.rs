//! Shell command value type.
//!
//! A [`ShellCommand`] is an ordered, immutable sequence of argument
//! strings. Argument order is significant and preserved; arguments are
//! never deduplicated. Concatenation with `+` produces a new command,
//! which is how the sudo/namespace/shell wrappers compose.

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use crate::error::ShellError;

/// Characters that survive rendering without quoting.
fn is_safe_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'@' | b'%' | b'+' | b'=' | b':' | b',' | b'.' | b'/' | b'-')
}

/// Renders one argument with POSIX single-quote escaping.
pub(crate) fn quote_argument(argument: &str) -> String {
    if !argument.is_empty() && argument.bytes().all(is_safe_byte) {
        return argument.to_owned();
    }
    let mut quoted = String::with_capacity(argument.len() + 2);
    quoted.push('\'');
    for ch in argument.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// An ordered, immutable command argument vector.
///
/// # Examples
///
/// ```
/// use stackprobe_shell::ShellCommand;
///
/// let base = ShellCommand::new(["ls", "-lh"]);
/// let full = ShellCommand::new(["sudo"]) + base;
/// assert_eq!(full.to_string(), "sudo ls -lh");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ShellCommand {
    arguments: Vec<String>,
}

impl ShellCommand {
    /// Creates a command from an argument sequence.
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a command line with shell-style quoting.
    ///
    /// Single quotes are literal, double quotes honor `\"` and `\\`
    /// escapes, and a backslash outside quotes escapes the next
    /// character. An unterminated quote is an error.
    pub fn parse(line: &str) -> Result<Self, ShellError> {
        let mut arguments = Vec::new();
        let mut current = String::new();
        let mut in_argument = false;
        let mut chars = line.chars();

        while let Some(ch) = chars.next() {
            match ch {
                c if c.is_whitespace() => {
                    if in_argument {
                        arguments.push(std::mem::take(&mut current));
                        in_argument = false;
                    }
                }
                '\'' => {
                    in_argument = true;
                    loop {
                        match chars.next() {
                            Some('\'') => break,
                            Some(c) => current.push(c),
                            None => {
                                return Err(ShellError::InvalidCommand {
                                    reason: format!("unterminated single quote in {line:?}"),
                                });
                            }
                        }
                    }
                }
                '"' => {
                    in_argument = true;
                    loop {
                        match chars.next() {
                            Some('"') => break,
                            Some('\\') => match chars.next() {
                                Some(escaped @ ('"' | '\\')) => current.push(escaped),
                                Some(other) => {
                                    current.push('\\');
                                    current.push(other);
                                }
                                None => {
                                    return Err(ShellError::InvalidCommand {
                                        reason: format!("dangling backslash in {line:?}"),
                                    });
                                }
                            },
                            Some(c) => current.push(c),
                            None => {
                                return Err(ShellError::InvalidCommand {
                                    reason: format!("unterminated double quote in {line:?}"),
                                });
                            }
                        }
                    }
                }
                '\\' => {
                    in_argument = true;
                    match chars.next() {
                        Some(escaped) => current.push(escaped),
                        None => {
                            return Err(ShellError::InvalidCommand {
                                reason: format!("dangling backslash in {line:?}"),
                            });
                        }
                    }
                }
                c => {
                    in_argument = true;
                    current.push(c);
                }
            }
        }
        if in_argument {
            arguments.push(current);
        }
        Ok(Self { arguments })
    }

    /// Returns a new command with `argument` appended.
    #[must_use]
    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Returns a new command with `arguments` appended in order.
    #[must_use]
    pub fn args<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    /// Returns the program name (the first argument).
    #[must_use]
    pub fn program(&self) -> Option<&str> {
        self.arguments.first().map(String::as_str)
    }

    /// Returns every argument in order.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Returns `true` for the empty command.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// Number of arguments, program included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arguments.len()
    }
}

impl fmt::Display for ShellCommand {
    /// Renders the shell-escaped command line used for logging and for
    /// shell/`exec`-request wrapping.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, argument) in self.arguments.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&quote_argument(argument))?;
        }
        Ok(())
    }
}

impl FromStr for ShellCommand {
    type Err = ShellError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Self::parse(line)
    }
}

impl Add for ShellCommand {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self.arguments.extend(rhs.arguments);
        self
    }
}

impl Add<&Self> for ShellCommand {
    type Output = Self;

    fn add(mut self, rhs: &Self) -> Self {
        self.arguments.extend(rhs.arguments.iter().cloned());
        self
    }
}

impl<S: Into<String>> FromIterator<S> for ShellCommand {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}
