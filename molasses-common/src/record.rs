//! Codec for the records exchanged on the internal pipes.
//!
//! A record is a run of `key = "value"` lines closed by a line holding a
//! single `%`. The front-end feeds `GREY`/`WHITE`/`TRAP` records to the
//! updater on the grey pipe; the scanner pushes `CONFIG` records (a
//! blacklist replacement) back to the front-end on the config pipe.
//! Unknown keys are ignored and a malformed record is dropped in its
//! entirety, with the reader resynchronising at the next delimiter.

use std::fmt::Write as _;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::RecordError;

/// Line closing every record on the wire.
pub const DELIMITER: &str = "%";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// First contact of an unknown client, captured at RCPT time.
    Grey {
        dst_ip: String,
        ip: String,
        helo: String,
        from: String,
        to: String,
    },
    /// Whitelist `ip` until `expires`.
    White {
        source: String,
        ip: String,
        expires: i64,
    },
    /// Trap `ip` until `expires`.
    Trap {
        source: String,
        ip: String,
        expires: i64,
    },
    /// Replace the blacklist called `name` with `message` and the given
    /// CIDR cover.
    Config {
        name: String,
        message: String,
        ips: Vec<String>,
    },
}

impl Record {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Grey { .. } => "GREY",
            Self::White { .. } => "WHITE",
            Self::Trap { .. } => "TRAP",
            Self::Config { .. } => "CONFIG",
        }
    }

    /// Render the record in wire form, delimiter included.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "type = {}", quote(self.type_tag()));

        match self {
            Self::Grey {
                dst_ip,
                ip,
                helo,
                from,
                to,
            } => {
                let _ = writeln!(out, "dst_ip = {}", quote(dst_ip));
                let _ = writeln!(out, "ip = {}", quote(ip));
                let _ = writeln!(out, "helo = {}", quote(helo));
                let _ = writeln!(out, "from = {}", quote(from));
                let _ = writeln!(out, "to = {}", quote(to));
            }
            Self::White { source, ip, expires } | Self::Trap { source, ip, expires } => {
                let _ = writeln!(out, "ip = {}", quote(ip));
                let _ = writeln!(out, "source = {}", quote(source));
                let _ = writeln!(out, "expires = {}", quote(&expires.to_string()));
            }
            Self::Config { name, message, ips } => {
                let _ = writeln!(out, "name = {}", quote(name));
                let _ = writeln!(out, "message = {}", quote(message));
                let quoted: Vec<String> = ips.iter().map(|ip| quote(ip)).collect();
                let _ = writeln!(out, "ips = [{}]", quoted.join(", "));
            }
        }

        out.push_str(DELIMITER);
        out.push('\n');
        out
    }

    fn from_fields(fields: &[(String, Value)]) -> Result<Self, RecordError> {
        let tag = get_str(fields, "type")?;

        match tag.as_str() {
            "GREY" => Ok(Self::Grey {
                dst_ip: get_str(fields, "dst_ip")?,
                ip: get_str(fields, "ip")?,
                helo: get_str(fields, "helo")?,
                from: get_str(fields, "from")?,
                to: get_str(fields, "to")?,
            }),
            "WHITE" => Ok(Self::White {
                source: get_str(fields, "source")?,
                ip: get_str(fields, "ip")?,
                expires: get_i64(fields, "expires")?,
            }),
            "TRAP" => Ok(Self::Trap {
                source: get_str(fields, "source")?,
                ip: get_str(fields, "ip")?,
                expires: get_i64(fields, "expires")?,
            }),
            "CONFIG" => Ok(Self::Config {
                name: get_str(fields, "name")?,
                message: get_str(fields, "message")?,
                ips: get_list(fields, "ips")?,
            }),
            _ => Err(RecordError::UnknownType(tag)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    List(Vec<String>),
}

fn lookup<'a>(fields: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    fields
        .iter()
        .find_map(|(k, v)| if k == key { Some(v) } else { None })
}

fn get_str(fields: &[(String, Value)], key: &'static str) -> Result<String, RecordError> {
    match lookup(fields, key) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(Value::List(_)) => Err(RecordError::Malformed(format!(
            "field {key} holds a list, expected a string"
        ))),
        None => Err(RecordError::MissingField(key)),
    }
}

fn get_i64(fields: &[(String, Value)], key: &'static str) -> Result<i64, RecordError> {
    let raw = get_str(fields, key)?;
    raw.parse()
        .map_err(|_| RecordError::Malformed(format!("field {key} is not a number: {raw:?}")))
}

fn get_list(fields: &[(String, Value)], key: &'static str) -> Result<Vec<String>, RecordError> {
    match lookup(fields, key) {
        Some(Value::List(items)) => Ok(items.clone()),
        Some(Value::Str(_)) => Err(RecordError::Malformed(format!(
            "field {key} holds a string, expected a list"
        ))),
        None => Err(RecordError::MissingField(key)),
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Parse a double-quoted value, returning the content and the offset one
/// past the closing quote.
fn unquote(s: &str) -> Result<(String, usize), RecordError> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'"') {
        return Err(RecordError::Malformed(format!("expected quoted value: {s:?}")));
    }

    let mut out = String::new();
    let mut escaped = false;
    for (at, c) in s.char_indices().skip(1) {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Ok((out, at + 1));
        } else {
            out.push(c);
        }
    }

    Err(RecordError::Malformed(format!("unterminated quote: {s:?}")))
}

fn parse_field(line: &str) -> Result<(String, Value), RecordError> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| RecordError::Malformed(line.to_owned()))?;
    let key = key.trim().to_owned();
    let value = value.trim();

    if let Some(inner) = value.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| RecordError::Malformed(format!("unterminated list: {line:?}")))?;
        let mut items = Vec::new();
        let mut rest = inner.trim_start();
        while !rest.is_empty() {
            let (item, consumed) = unquote(rest)?;
            items.push(item);
            rest = rest[consumed..].trim_start();
            if let Some(after) = rest.strip_prefix(',') {
                rest = after.trim_start();
            } else if !rest.is_empty() {
                return Err(RecordError::Malformed(format!("junk in list: {line:?}")));
            }
        }
        return Ok((key, Value::List(items)));
    }

    if value.starts_with('"') {
        let (s, consumed) = unquote(value)?;
        if !value[consumed..].trim().is_empty() {
            return Err(RecordError::Malformed(format!("junk after value: {line:?}")));
        }
        return Ok((key, Value::Str(s)));
    }

    // Tolerate bare tokens, so unquoted numbers still parse.
    Ok((key, Value::Str(value.to_owned())))
}

/// Reads records off one of the internal pipes.
pub struct RecordReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// The next well-formed record, or `None` once the pipe is closed.
    /// Malformed records are logged and skipped; a partial record cut off
    /// by EOF is dropped.
    pub async fn next_record(&mut self) -> io::Result<Option<Record>> {
        let mut fields: Vec<(String, Value)> = Vec::new();
        let mut broken = false;
        let mut line = String::new();

        loop {
            line.clear();
            if self.inner.read_line(&mut line).await? == 0 {
                return Ok(None);
            }

            let trimmed = line.trim();
            if trimmed == DELIMITER {
                if !broken {
                    match Record::from_fields(&fields) {
                        Ok(record) => return Ok(Some(record)),
                        Err(err) => tracing::warn!("discarding record: {err}"),
                    }
                }
                fields.clear();
                broken = false;
                continue;
            }

            if trimmed.is_empty() || broken {
                continue;
            }

            match parse_field(trimmed) {
                Ok(field) => fields.push(field),
                Err(err) => {
                    tracing::warn!("discarding record: {err}");
                    broken = true;
                }
            }
        }
    }
}

/// Writes records onto one of the internal pipes, flushing per record so
/// the peer sees whole records only.
pub struct RecordWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// The pipe itself, for callers that need it directly.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub async fn write_record(&mut self, record: &Record) -> io::Result<()> {
        self.inner.write_all(record.encode().as_bytes()).await?;
        self.inner.flush().await
    }
}
