//! Blocklist parsing and membership checks.
//!
//! The feed is a `;`-separated table whose first record is a header. The
//! first column of every other record holds either one address or several
//! addresses joined with `|`. Anything in that column that is not an IP
//! address (hostnames, comments, empty cells) is skipped, but a data record
//! that cannot be tokenised at all fails the whole parse. The header is
//! dropped even when malformed.

use std::collections::HashSet;
use std::iter::Peekable;
use std::net::IpAddr;
use std::str::Chars;

use thiserror::Error;
use tracing::{debug, warn};

/// Field delimiter used by the feed.
pub const FIELD_DELIMITER: char = ';';

/// Separator between addresses sharing one cell.
const ADDRESS_SEPARATOR: char = '|';

/// Tokenisation failure. Any of these aborts the parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: bare \" in non-quoted field")]
    BareQuote { line: usize },

    #[error("line {line}: extraneous or missing \" in quoted field")]
    ExtraneousQuote { line: usize },

    #[error("line {line}: quoted field is not terminated before end of input")]
    UnterminatedQuote { line: usize },
}

/// Set of banned addresses built from one feed snapshot.
///
/// Addresses are stored in canonical form: an IPv4-mapped IPv6 address
/// (`::ffff:1.2.3.4`) is the same entry as its IPv4 form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocklist {
    addrs: HashSet<IpAddr>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an address. Returns false if it was already present.
    pub fn insert(&mut self, ip: IpAddr) -> bool {
        self.addrs.insert(ip.to_canonical())
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addrs.contains(&ip.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.addrs.iter()
    }
}

impl FromIterator<IpAddr> for Blocklist {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        let mut list = Blocklist::new();
        for ip in iter {
            list.insert(ip);
        }
        list
    }
}

/// Check whether `ip` is listed.
#[inline]
pub fn is_blocked(list: &Blocklist, ip: &IpAddr) -> bool {
    list.contains(ip)
}

/// Parse a raw feed into a [`Blocklist`].
///
/// The first record is discarded whatever it contains. Records may have any
/// number of fields; only the first one is read.
pub fn parse_blocklist(content: &[u8]) -> Result<Blocklist, ParseError> {
    let text = String::from_utf8_lossy(content);
    let mut records = Records::new(&text, FIELD_DELIMITER);

    // header, discarded even when it does not tokenize
    if let Some(Err(e)) = records.next() {
        warn!("Ignoring malformed feed header: {}", e);
        records.resume_on_next_line();
    }

    let mut list = Blocklist::new();
    let mut rows = 0usize;
    let mut skipped = 0usize;

    for record in records {
        let record = record?;
        rows += 1;

        let Some(cell) = record.first() else {
            continue;
        };

        let (found, invalid) = addresses_in_cell(cell);
        skipped += invalid;
        for ip in found {
            list.insert(ip);
        }
    }

    debug!(
        rows,
        unique = list.len(),
        skipped,
        "Parsed blocklist feed"
    );

    Ok(list)
}

/// Extract every valid address from an address cell.
///
/// Returns the addresses and the number of tokens that did not parse.
fn addresses_in_cell(cell: &str) -> (Vec<IpAddr>, usize) {
    let mut found = Vec::new();
    let mut invalid = 0;

    if cell.contains(ADDRESS_SEPARATOR) {
        for token in cell.split(ADDRESS_SEPARATOR) {
            match token.trim().parse::<IpAddr>() {
                Ok(ip) => found.push(ip),
                Err(_) => invalid += 1,
            }
        }
    } else {
        match cell.parse::<IpAddr>() {
            Ok(ip) => found.push(ip),
            Err(_) if cell.is_empty() => {}
            Err(_) => invalid += 1,
        }
    }

    (found, invalid)
}

/// Iterator over the records of a delimiter-separated text.
///
/// Quoting follows RFC 4180: a field starting with `"` runs until the next
/// lone `"`, `""` inside it is a literal quote, and it may span lines. A `"`
/// anywhere in an unquoted field is an error. Blank lines are skipped and
/// `\r\n` terminates a record like `\n` does.
struct Records<'a> {
    chars: Peekable<Chars<'a>>,
    delimiter: char,
    line: usize,
    failed: bool,
}

impl<'a> Records<'a> {
    fn new(text: &'a str, delimiter: char) -> Self {
        Self {
            chars: text.chars().peekable(),
            delimiter,
            line: 1,
            failed: false,
        }
    }

    /// Consume blank lines. Returns false at end of input.
    fn skip_blank_lines(&mut self) -> bool {
        loop {
            match self.chars.peek() {
                None => return false,
                Some('\n') => {
                    self.chars.next();
                    self.line += 1;
                }
                Some('\r') => {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    if ahead.peek() == Some(&'\n') {
                        self.chars.next();
                        self.chars.next();
                        self.line += 1;
                    } else {
                        return true;
                    }
                }
                Some(_) => return true,
            }
        }
    }

    /// Consume a `\n` or `\r\n` if one is next. Returns true if it did.
    fn eat_newline(&mut self) -> bool {
        match self.chars.peek() {
            Some('\n') => {
                self.chars.next();
                self.line += 1;
                true
            }
            Some('\r') => {
                let mut ahead = self.chars.clone();
                ahead.next();
                if ahead.peek() == Some(&'\n') {
                    self.chars.next();
                    self.chars.next();
                    self.line += 1;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Drop the rest of the line an error stopped in and carry on from the
    /// next one. An unterminated quote has already consumed all input.
    fn resume_on_next_line(&mut self) {
        while self.chars.peek().is_some() {
            if self.eat_newline() {
                break;
            }
            self.chars.next();
        }
        self.failed = false;
    }

    fn read_record(&mut self) -> Result<Vec<String>, ParseError> {
        let mut fields = Vec::new();

        loop {
            let field = if self.chars.peek() == Some(&'"') {
                self.chars.next();
                self.read_quoted()?
            } else {
                self.read_unquoted()?
            };
            fields.push(field);

            if self.chars.peek() == Some(&self.delimiter) {
                self.chars.next();
                continue;
            }

            // Field readers stop only at a delimiter, a newline, or end of input.
            self.eat_newline();
            return Ok(fields);
        }
    }

    fn read_unquoted(&mut self) -> Result<String, ParseError> {
        let mut field = String::new();

        loop {
            match self.chars.peek() {
                None => return Ok(field),
                Some(&c) if c == self.delimiter => return Ok(field),
                Some('\n') => return Ok(field),
                Some('\r') => {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    if ahead.peek() == Some(&'\n') {
                        return Ok(field);
                    }
                    field.push('\r');
                    self.chars.next();
                }
                Some('"') => return Err(ParseError::BareQuote { line: self.line }),
                Some(&c) => {
                    field.push(c);
                    self.chars.next();
                }
            }
        }
    }

    fn read_quoted(&mut self) -> Result<String, ParseError> {
        let start_line = self.line;
        let mut field = String::new();

        loop {
            match self.chars.next() {
                None => return Err(ParseError::UnterminatedQuote { line: start_line }),
                Some('"') => match self.chars.peek() {
                    Some('"') => {
                        field.push('"');
                        self.chars.next();
                    }
                    None | Some('\n') => return Ok(field),
                    Some(&c) if c == self.delimiter => return Ok(field),
                    Some('\r') => {
                        let mut ahead = self.chars.clone();
                        ahead.next();
                        if ahead.peek() == Some(&'\n') {
                            return Ok(field);
                        }
                        return Err(ParseError::ExtraneousQuote { line: self.line });
                    }
                    Some(_) => return Err(ParseError::ExtraneousQuote { line: self.line }),
                },
                Some('\n') => {
                    field.push('\n');
                    self.line += 1;
                }
                Some(c) => field.push(c),
            }
        }
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Vec<String>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.skip_blank_lines() {
            return None;
        }

        let record = self.read_record();
        if record.is_err() {
            self.failed = true;
        }
        Some(record)
    }
}
