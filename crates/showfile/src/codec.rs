//! Scene file reader/writer.
//!
//! Grammar (one file, header first):
//!
//! ```text
//! #<firmware># "<name>" "<notes>" <safetymask> <hasaliases>
//! /address value value ...
//! ```
//!
//! Values print as the console expects them: integers bare, floats with a
//! decimal point, strings double-quoted with embedded quotes doubled.
//! Reading is tolerant — surplus whitespace is ignored, missing trailing
//! header fields default to zero, blank lines and `#` comments after the
//! header are skipped.

use x32osc::OscValue;

/// Header line of a scene or backup file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneHeader {
    pub firmware: String,
    pub name: String,
    pub notes: String,
    pub safety_mask: u32,
    pub has_aliases: u32,
}

impl SceneHeader {
    pub fn new(firmware: &str, name: &str, notes: &str) -> Self {
        Self {
            firmware: firmware.to_string(),
            name: name.to_string(),
            notes: notes.to_string(),
            safety_mask: 0,
            has_aliases: 0,
        }
    }
}

/// One parameter line: address plus printed values.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneRecord {
    pub address: String,
    pub values: Vec<OscValue>,
}

impl SceneRecord {
    pub fn new(address: impl Into<String>, values: Vec<OscValue>) -> Self {
        Self {
            address: address.into(),
            values,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ShowfileError {
    #[error("missing header line")]
    MissingHeader,
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: &'static str },
}

/// Serialize a header and records to file text. Every line, including the
/// last record, ends with a newline.
pub fn write(header: &SceneHeader, records: &[SceneRecord]) -> String {
    let mut out = String::with_capacity(64 + records.len() * 32);
    out.push('#');
    out.push_str(&header.firmware);
    out.push_str("# \"");
    out.push_str(&escape_quotes(&header.name));
    out.push_str("\" \"");
    out.push_str(&escape_quotes(&header.notes));
    out.push_str("\" ");
    out.push_str(&header.safety_mask.to_string());
    out.push(' ');
    out.push_str(&header.has_aliases.to_string());
    out.push('\n');

    for record in records {
        out.push_str(&record.address);
        for value in &record.values {
            out.push(' ');
            out.push_str(&print_value(value));
        }
        out.push('\n');
    }
    out
}

/// Parse file text back into header and records.
pub fn read(text: &str) -> Result<(SceneHeader, Vec<SceneRecord>), ShowfileError> {
    let mut lines = text.lines().enumerate();

    let header = loop {
        let (index, line) = lines.next().ok_or(ShowfileError::MissingHeader)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        break parse_header(index + 1, trimmed)?;
    };

    let mut records = Vec::new();
    for (index, line) in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        records.push(parse_record(index + 1, trimmed)?);
    }

    Ok((header, records))
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\"\"")
}

fn print_value(value: &OscValue) -> String {
    match value {
        OscValue::Int(v) => v.to_string(),
        OscValue::Float(v) => print_float(*v),
        OscValue::Str(s) => format!("\"{}\"", escape_quotes(s)),
        OscValue::Blob(b) => format!("%{}", hex::encode(b)),
    }
}

/// Shortest decimal that parses back to the identical f32, with a forced
/// fraction so the reader types it as a float. Non-finite values cannot
/// appear in console state and collapse to zero.
fn print_float(v: f32) -> String {
    if !v.is_finite() {
        return "0.0".to_string();
    }
    let s = format!("{}", v);
    if s.contains('.') {
        s
    } else {
        format!("{}.0", s)
    }
}

fn parse_header(line_no: usize, line: &str) -> Result<SceneHeader, ShowfileError> {
    let rest = line
        .strip_prefix('#')
        .ok_or(ShowfileError::MissingHeader)?;
    let close = rest.find('#').ok_or(ShowfileError::Malformed {
        line: line_no,
        message: "header firmware field is not #-delimited",
    })?;
    let firmware = rest[..close].to_string();

    let mut scanner = Scanner::new(&rest[close + 1..], line_no);
    let name = scanner.quoted_or_default()?;
    let notes = scanner.quoted_or_default()?;
    let safety_mask = scanner.int_or_default();
    let has_aliases = scanner.int_or_default();

    Ok(SceneHeader {
        firmware,
        name,
        notes,
        safety_mask,
        has_aliases,
    })
}

fn parse_record(line_no: usize, line: &str) -> Result<SceneRecord, ShowfileError> {
    let mut scanner = Scanner::new(line, line_no);
    let tokens = scanner.all_tokens()?;
    let mut tokens = tokens.into_iter();

    let address = match tokens.next() {
        Some(Token::Bare(address)) if address.starts_with('/') => address,
        _ => {
            return Err(ShowfileError::Malformed {
                line: line_no,
                message: "record must start with a slash address",
            })
        }
    };

    let values = tokens.map(classify).collect();
    Ok(SceneRecord { address, values })
}

fn classify(token: Token) -> OscValue {
    match token {
        Token::Quoted(s) => OscValue::Str(s),
        Token::Bare(s) => {
            if is_int(&s) {
                if let Ok(v) = s.parse::<i32>() {
                    return OscValue::Int(v);
                }
            }
            if is_float(&s) {
                if let Ok(v) = s.parse::<f32>() {
                    return OscValue::Float(v);
                }
            }
            if let Some(hex_part) = s.strip_prefix('%') {
                if !hex_part.is_empty() && hex_part.len() % 2 == 0 {
                    if let Ok(bytes) = hex::decode(hex_part) {
                        return OscValue::Blob(bytes);
                    }
                }
            }
            OscValue::Str(s)
        }
    }
}

fn is_int(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_float(s: &str) -> bool {
    let body = s.strip_prefix('-').unwrap_or(s);
    let Some((whole, fraction)) = body.split_once('.') else {
        return false;
    };
    let digits_ok = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    digits_ok(whole) && digits_ok(fraction) && (!whole.is_empty() || !fraction.is_empty())
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Bare(String),
    Quoted(String),
}

/// Whitespace-separated token scanner with quote awareness.
struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str, line: usize) -> Self {
        Self {
            chars: text.chars().peekable(),
            line,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, ShowfileError> {
        self.skip_whitespace();
        let Some(&first) = self.chars.peek() else {
            return Ok(None);
        };
        if first == '"' {
            self.chars.next();
            let mut text = String::new();
            loop {
                match self.chars.next() {
                    Some('"') => {
                        // A doubled quote is a literal quote.
                        if self.chars.peek() == Some(&'"') {
                            self.chars.next();
                            text.push('"');
                        } else {
                            return Ok(Some(Token::Quoted(text)));
                        }
                    }
                    Some(c) => text.push(c),
                    None => {
                        return Err(ShowfileError::Malformed {
                            line: self.line,
                            message: "unterminated quoted string",
                        })
                    }
                }
            }
        } else {
            let mut text = String::new();
            while let Some(&c) = self.chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                text.push(c);
                self.chars.next();
            }
            Ok(Some(Token::Bare(text)))
        }
    }

    fn all_tokens(&mut self) -> Result<Vec<Token>, ShowfileError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn quoted_or_default(&mut self) -> Result<String, ShowfileError> {
        self.skip_whitespace();
        if self.chars.peek() == Some(&'"') {
            match self.next_token()? {
                Some(Token::Quoted(s)) => Ok(s),
                _ => Ok(String::new()),
            }
        } else {
            Ok(String::new())
        }
    }

    fn int_or_default(&mut self) -> u32 {
        match self.next_token() {
            Ok(Some(Token::Bare(s))) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }
}
