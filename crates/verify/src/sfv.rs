//! Hand-written subset of RFC 8941 structured fields.
//!
//! Covers exactly what the receipt pointer and `Signature`/`Signature-Input`
//! headers need: dictionaries whose member values are bare items or inner
//! lists, with parameters. The scanner walks the input one byte at a time;
//! there is deliberately no regex anywhere in this crate.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SfvError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("invalid dictionary key at offset {0}")]
    InvalidKey(usize),
    #[error("duplicate dictionary key {0:?}")]
    DuplicateKey(String),
    #[error("integer out of range at offset {0}")]
    IntegerOutOfRange(usize),
    #[error("invalid byte sequence at offset {0}")]
    InvalidByteSequence(usize),
}

/// A bare item: the value forms this subset understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BareItem {
    String(String),
    Token(String),
    Integer(i64),
    ByteSequence(Vec<u8>),
    Boolean(bool),
}

impl BareItem {
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            BareItem::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BareItem::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BareItem::ByteSequence(b) => Some(b),
            _ => None,
        }
    }
}

pub type Parameters = Vec<(String, BareItem)>;

/// One item of an inner list, with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerListItem {
    pub value: BareItem,
    pub params: Parameters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberValue {
    Item(BareItem),
    InnerList(Vec<InnerListItem>),
}

/// A dictionary member: value, parameters, and the raw as-received text of
/// everything after the `=` (needed to rebuild `@signature-params` lines
/// byte-for-byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub value: MemberValue,
    pub params: Parameters,
    pub raw: String,
}

impl Member {
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&BareItem> {
        self.params
            .iter()
            .find_map(|(k, v)| (k == name).then_some(v))
    }
}

/// Parse a structured-field dictionary, preserving member order.
///
/// Duplicate keys are rejected (stricter than RFC 8941's last-wins rule; the
/// wire profiles this gateway accepts treat duplicates as hostile input).
pub fn parse_dictionary(input: &str) -> Result<Vec<(String, Member)>, SfvError> {
    let mut scanner = Scanner::new(input);
    let mut members: Vec<(String, Member)> = Vec::new();

    scanner.skip_ows();
    if scanner.at_end() {
        return Ok(members);
    }

    loop {
        let key = scanner.parse_key()?;
        if members.iter().any(|(k, _)| *k == key) {
            return Err(SfvError::DuplicateKey(key));
        }

        let member = if scanner.peek() == Some(b'=') {
            scanner.advance();
            let start = scanner.pos;
            let value = scanner.parse_member_value()?;
            let params = scanner.parse_parameters()?;
            let raw = scanner.input[start..scanner.pos].to_owned();
            Member { value, params, raw }
        } else {
            // A bare key is boolean true per RFC 8941.
            let start = scanner.pos;
            let params = scanner.parse_parameters()?;
            Member {
                value: MemberValue::Item(BareItem::Boolean(true)),
                params,
                raw: scanner.input[start..scanner.pos].to_owned(),
            }
        };
        members.push((key, member));

        scanner.skip_ows();
        if scanner.at_end() {
            return Ok(members);
        }
        scanner.expect(b',')?;
        scanner.skip_ows();
        if scanner.at_end() {
            return Err(SfvError::UnexpectedEnd);
        }
    }
}

struct Scanner<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn expect(&mut self, b: u8) -> Result<(), SfvError> {
        match self.peek() {
            Some(got) if got == b => {
                self.advance();
                Ok(())
            }
            Some(got) => Err(SfvError::UnexpectedChar(got as char, self.pos)),
            None => Err(SfvError::UnexpectedEnd),
        }
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.advance();
        }
    }

    fn skip_sp(&mut self) {
        while self.peek() == Some(b' ') {
            self.advance();
        }
    }

    fn parse_key(&mut self) -> Result<String, SfvError> {
        let start = self.pos;
        match self.peek() {
            Some(b'a'..=b'z' | b'*') => self.advance(),
            _ => return Err(SfvError::InvalidKey(self.pos)),
        }
        while let Some(b) = self.peek() {
            match b {
                b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b'*' => self.advance(),
                _ => break,
            }
        }
        Ok(self.input[start..self.pos].to_owned())
    }

    fn parse_member_value(&mut self) -> Result<MemberValue, SfvError> {
        if self.peek() == Some(b'(') {
            Ok(MemberValue::InnerList(self.parse_inner_list()?))
        } else {
            Ok(MemberValue::Item(self.parse_bare_item()?))
        }
    }

    fn parse_inner_list(&mut self) -> Result<Vec<InnerListItem>, SfvError> {
        self.expect(b'(')?;
        let mut items = Vec::new();
        loop {
            self.skip_sp();
            match self.peek() {
                Some(b')') => {
                    self.advance();
                    return Ok(items);
                }
                Some(_) => {
                    let value = self.parse_bare_item()?;
                    let params = self.parse_parameters()?;
                    items.push(InnerListItem { value, params });
                    // Items are separated by spaces or terminated by ')'.
                    match self.peek() {
                        Some(b' ' | b')') => {}
                        Some(other) => {
                            return Err(SfvError::UnexpectedChar(other as char, self.pos));
                        }
                        None => return Err(SfvError::UnexpectedEnd),
                    }
                }
                None => return Err(SfvError::UnexpectedEnd),
            }
        }
    }

    fn parse_parameters(&mut self) -> Result<Parameters, SfvError> {
        let mut params = Vec::new();
        while self.peek() == Some(b';') {
            self.advance();
            self.skip_sp();
            let key = self.parse_key()?;
            let value = if self.peek() == Some(b'=') {
                self.advance();
                self.parse_bare_item()?
            } else {
                BareItem::Boolean(true)
            };
            params.push((key, value));
        }
        Ok(params)
    }

    fn parse_bare_item(&mut self) -> Result<BareItem, SfvError> {
        match self.peek() {
            Some(b'"') => self.parse_string(),
            Some(b':') => self.parse_byte_sequence(),
            Some(b'?') => self.parse_boolean(),
            Some(b'-' | b'0'..=b'9') => self.parse_integer(),
            Some(b'A'..=b'Z' | b'a'..=b'z' | b'*') => self.parse_token(),
            Some(other) => Err(SfvError::UnexpectedChar(other as char, self.pos)),
            None => Err(SfvError::UnexpectedEnd),
        }
    }

    fn parse_string(&mut self) -> Result<BareItem, SfvError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.peek() {
                Some(b'"') => {
                    self.advance();
                    return Ok(BareItem::String(out));
                }
                Some(b'\\') => {
                    self.advance();
                    match self.peek() {
                        Some(b @ (b'"' | b'\\')) => {
                            out.push(b as char);
                            self.advance();
                        }
                        Some(other) => {
                            return Err(SfvError::UnexpectedChar(other as char, self.pos));
                        }
                        None => return Err(SfvError::UnexpectedEnd),
                    }
                }
                // Printable ASCII only, per RFC 8941 strings.
                Some(b @ 0x20..=0x7e) => {
                    out.push(b as char);
                    self.advance();
                }
                Some(other) => return Err(SfvError::UnexpectedChar(other as char, self.pos)),
                None => return Err(SfvError::UnexpectedEnd),
            }
        }
    }

    fn parse_byte_sequence(&mut self) -> Result<BareItem, SfvError> {
        use base64::Engine as _;
        use base64::engine::general_purpose::STANDARD;

        let open = self.pos;
        self.expect(b':')?;
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/' | b'=' => self.advance(),
                b':' => break,
                other => return Err(SfvError::UnexpectedChar(other as char, self.pos)),
            }
        }
        self.expect(b':')?;
        let encoded = &self.input[start..self.pos - 1];
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| SfvError::InvalidByteSequence(open))?;
        Ok(BareItem::ByteSequence(bytes))
    }

    fn parse_boolean(&mut self) -> Result<BareItem, SfvError> {
        self.expect(b'?')?;
        match self.peek() {
            Some(b'0') => {
                self.advance();
                Ok(BareItem::Boolean(false))
            }
            Some(b'1') => {
                self.advance();
                Ok(BareItem::Boolean(true))
            }
            Some(other) => Err(SfvError::UnexpectedChar(other as char, self.pos)),
            None => Err(SfvError::UnexpectedEnd),
        }
    }

    fn parse_integer(&mut self) -> Result<BareItem, SfvError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.advance();
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.advance();
        }
        let digits = self.pos - digits_start;
        if digits == 0 {
            return Err(SfvError::UnexpectedEnd);
        }
        // Decimals are not part of this subset; a '.' here is an error.
        if self.peek() == Some(b'.') {
            return Err(SfvError::UnexpectedChar('.', self.pos));
        }
        if digits > 15 {
            return Err(SfvError::IntegerOutOfRange(start));
        }
        self.input[start..self.pos]
            .parse::<i64>()
            .map(BareItem::Integer)
            .map_err(|_| SfvError::IntegerOutOfRange(start))
    }

    fn parse_token(&mut self) -> Result<BareItem, SfvError> {
        let start = self.pos;
        match self.peek() {
            Some(b'A'..=b'Z' | b'a'..=b'z' | b'*') => self.advance(),
            Some(other) => return Err(SfvError::UnexpectedChar(other as char, self.pos)),
            None => return Err(SfvError::UnexpectedEnd),
        }
        while let Some(b) = self.peek() {
            match b {
                b'A'..=b'Z'
                | b'a'..=b'z'
                | b'0'..=b'9'
                | b'!'
                | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
                | b':'
                | b'/' => self.advance(),
                _ => break,
            }
        }
        Ok(BareItem::Token(self.input[start..self.pos].to_owned()))
    }
}

/// Serialize a string as an sf-string (quoting and escaping).
#[must_use]
pub fn serialize_string(s: &str) -> String {
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
