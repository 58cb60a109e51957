//! Token-level encoding for the CLI wire format.
//!
//! Every line is a sequence of space-separated tokens. Tokens are
//! percent-encoded on the wire so values containing spaces survive,
//! and decoded on receipt. Catalog replies carry `key:value` tagged
//! tokens; a record begins each time the record-start key repeats.

use std::borrow::Cow;
use std::fmt;

/// Placeholder the server uses when echoing a password.
pub const MASKED_PASSWORD: &str = "******";

/// Encode a single token for the wire.
pub fn encode_token(token: &str) -> Cow<'_, str> {
    urlencoding::encode(token)
}

/// Decode a single wire token, falling back to the raw text when the
/// escape sequence does not produce valid UTF-8.
pub fn decode_token(token: &str) -> String {
    urlencoding::decode(token)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| token.to_string())
}

/// Join tokens into one wire line (without the terminator).
pub fn encode_line<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| encode_token(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split and decode one wire line.
pub fn decode_line(line: &str) -> Vec<String> {
    line.split_whitespace().map(decode_token).collect()
}

/// Split a decoded `key:value` token at the first colon.
pub fn split_tag(token: &str) -> Option<(&str, &str)> {
    token.split_once(':')
}

/// One outgoing command.
///
/// `echo_len` is the number of leading tokens the server repeats verbatim in
/// its reply; the session uses it to tell a reply from a pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    tokens: Vec<String>,
    echo_len: usize,
    secret_from: Option<usize>,
}

impl Command {
    /// Build a command. The echo prefix defaults to every token before the
    /// first `?` placeholder.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let echo_len = tokens
            .iter()
            .position(|t| t == "?")
            .unwrap_or(tokens.len());
        Self {
            tokens,
            echo_len,
            secret_from: None,
        }
    }

    /// `login <user> <pass>`; the server masks the password in its echo.
    pub fn login(username: &str, password: &str) -> Self {
        Self {
            tokens: vec!["login".into(), username.into(), password.into()],
            echo_len: 2,
            secret_from: Some(2),
        }
    }

    pub fn with_echo_len(mut self, echo_len: usize) -> Self {
        self.echo_len = echo_len.min(self.tokens.len());
        self
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn echo_len(&self) -> usize {
        self.echo_len
    }

    /// The wire line for this command.
    pub fn to_line(&self) -> String {
        encode_line(&self.tokens)
    }

    /// Whether a decoded reply line answers this command.
    pub fn is_echoed_by(&self, reply: &[String]) -> bool {
        reply.len() >= self.echo_len && reply[..self.echo_len] == self.tokens[..self.echo_len]
    }
}

impl fmt::Display for Command {
    /// Loggable form; secret tokens are masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match self.secret_from {
                Some(from) if i >= from => f.write_str(MASKED_PASSWORD)?,
                _ => f.write_str(token)?,
            }
        }
        Ok(())
    }
}

/// One `key:value` record out of a catalog reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Tagged tokens of a reply split into header parameters and records.
#[derive(Debug, Default)]
pub struct TaggedReply {
    pub header: Record,
    pub records: Vec<Record>,
}

/// Group tagged tokens into records.
///
/// A new record starts at every `start_key`. Keys listed in `header_keys`
/// always go to the header wherever they appear (the server places `count`
/// after the records). Untagged tokens are ignored.
pub fn parse_tagged(tokens: &[String], start_key: &str, header_keys: &[&str]) -> TaggedReply {
    let mut reply = TaggedReply::default();
    let mut current: Option<Record> = None;

    for token in tokens {
        let Some((key, value)) = split_tag(token) else {
            continue;
        };

        if header_keys.contains(&key) {
            reply.header.push(key, value);
            continue;
        }

        if key == start_key {
            if let Some(done) = current.take() {
                reply.records.push(done);
            }
            current = Some(Record::default());
        }

        match current.as_mut() {
            Some(record) => record.push(key, value),
            None => reply.header.push(key, value),
        }
    }

    if let Some(done) = current {
        reply.records.push(done);
    }
    reply
}
