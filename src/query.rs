use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use roaring::RoaringBitmap;

use crate::mvmap::Arena;
use crate::{MvMap, MvMapError, MvMapHashLoader, MvMapView, Result};

/// Deepest nesting of `!` and parentheses accepted by [`Query::parse`].
const MAX_DEPTH: usize = 256;

/// A boolean expression over the keys of a map.
///
/// A key denotes the set of value ids stored under it, an absent key the
/// empty set. Queries are usually parsed from text:
///
/// ```text
/// expr  := or
/// or    := and ('|' and)*
/// and   := unary ('&' unary)*
/// unary := '!' unary | '(' expr ')' | key
/// ```
///
/// A key is either a run of characters other than whitespace and `&|!()"`,
/// or a double-quoted string where `\"` and `\\` are the only escapes.
///
/// Queries can also be assembled with the `&`, `|` and `!` operators:
///
/// ```
/// use mvmap::Query;
///
/// let q = Query::key("red") & !Query::key("apple");
/// assert_eq!(q, Query::parse("red & !apple").unwrap());
/// assert_eq!(q.to_string(), "red & !apple");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    Key(Vec<u8>),
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
}

impl Query {
    pub fn key(key: impl AsRef<[u8]>) -> Self {
        Query::Key(key.as_ref().to_vec())
    }

    /// Parses a query expression.
    ///
    /// # Errors
    ///
    /// Returns [`MvMapError::Parse`] with the byte offset of the problem for
    /// empty input, unbalanced parentheses, dangling operators, unterminated
    /// quotes, trailing input and nesting deeper than 256 levels.
    pub fn parse(text: &str) -> Result<Query> {
        if text.trim().is_empty() {
            return Err(MvMapError::parse(0, "empty expression"));
        }
        let mut parser = Parser {
            lexer: Lexer {
                input: text.as_bytes(),
                pos: 0,
            },
            peeked: None,
            depth: 0,
        };
        let query = parser.parse_or()?;
        match parser.bump()? {
            (_, Token::End) => Ok(query),
            (pos, token) => Err(MvMapError::parse(
                pos,
                format!("unexpected {} after expression", token),
            )),
        }
    }

    fn is_compound(&self) -> bool {
        matches!(self, Query::And(_) | Query::Or(_))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operand = |f: &mut fmt::Formatter<'_>, q: &Query| {
            if q.is_compound() {
                write!(f, "({})", q)
            } else {
                write!(f, "{}", q)
            }
        };
        match self {
            Query::Key(key) => write_key(f, key),
            Query::Not(inner) => {
                f.write_str("!")?;
                operand(f, inner)
            }
            Query::And(operands) | Query::Or(operands) => {
                let separator = if matches!(self, Query::And(_)) {
                    " & "
                } else {
                    " | "
                };
                for (i, q) in operands.iter().enumerate() {
                    if i > 0 {
                        f.write_str(separator)?;
                    }
                    operand(f, q)?;
                }
                Ok(())
            }
        }
    }
}

fn is_plain(b: u8) -> bool {
    !b.is_ascii_whitespace() && !matches!(b, b'&' | b'|' | b'!' | b'(' | b')' | b'"')
}

/// Keys that are not valid UTF-8 are written lossily.
fn write_key(f: &mut fmt::Formatter<'_>, key: &[u8]) -> fmt::Result {
    let text = String::from_utf8_lossy(key);
    if !key.is_empty() && key.iter().all(|&b| is_plain(b)) {
        return f.write_str(&text);
    }
    f.write_str("\"")?;
    for c in text.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{}", c)?;
    }
    f.write_str("\"")
}

impl BitAnd for Query {
    type Output = Query;

    fn bitand(self, rhs: Query) -> Query {
        match (self, rhs) {
            (Query::And(mut lhs), Query::And(rhs)) => {
                lhs.extend(rhs);
                Query::And(lhs)
            }
            (Query::And(mut lhs), rhs) => {
                lhs.push(rhs);
                Query::And(lhs)
            }
            (lhs, rhs) => Query::And(vec![lhs, rhs]),
        }
    }
}

impl BitOr for Query {
    type Output = Query;

    fn bitor(self, rhs: Query) -> Query {
        match (self, rhs) {
            (Query::Or(mut lhs), Query::Or(rhs)) => {
                lhs.extend(rhs);
                Query::Or(lhs)
            }
            (Query::Or(mut lhs), rhs) => {
                lhs.push(rhs);
                Query::Or(lhs)
            }
            (lhs, rhs) => Query::Or(vec![lhs, rhs]),
        }
    }
}

impl Not for Query {
    type Output = Query;

    fn not(self) -> Query {
        Query::Not(Box::new(self))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    Open,
    Close,
    Key(Vec<u8>),
    End,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::And => f.write_str("'&'"),
            Token::Or => f.write_str("'|'"),
            Token::Not => f.write_str("'!'"),
            Token::Open => f.write_str("'('"),
            Token::Close => f.write_str("')'"),
            Token::Key(key) => write!(f, "key '{}'", String::from_utf8_lossy(key)),
            Token::End => f.write_str("end of input"),
        }
    }
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Lexer<'_> {
    /// Returns the next token and the byte offset it starts at.
    fn next_token(&mut self) -> Result<(usize, Token)> {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        let start = self.pos;
        let Some(&b) = self.input.get(start) else {
            return Ok((start, Token::End));
        };
        let token = match b {
            b'&' => Token::And,
            b'|' => Token::Or,
            b'!' => Token::Not,
            b'(' => Token::Open,
            b')' => Token::Close,
            b'"' => return self.quoted(start).map(|key| (start, Token::Key(key))),
            _ => {
                while self.pos < self.input.len() && is_plain(self.input[self.pos]) {
                    self.pos += 1;
                }
                return Ok((start, Token::Key(self.input[start..self.pos].to_vec())));
            }
        };
        self.pos += 1;
        Ok((start, token))
    }

    fn quoted(&mut self, start: usize) -> Result<Vec<u8>> {
        let mut key = Vec::new();
        self.pos += 1;
        loop {
            match self.input.get(self.pos) {
                None => return Err(MvMapError::parse(start, "unterminated quoted key")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(key);
                }
                Some(b'\\') => match self.input.get(self.pos + 1) {
                    Some(&escaped @ (b'"' | b'\\')) => {
                        key.push(escaped);
                        self.pos += 2;
                    }
                    None => return Err(MvMapError::parse(start, "unterminated quoted key")),
                    Some(_) => {
                        return Err(MvMapError::parse(
                            self.pos,
                            "only \\\" and \\\\ escapes are supported",
                        ));
                    }
                },
                Some(&b) => {
                    key.push(b);
                    self.pos += 1;
                }
            }
        }
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<(usize, Token)>,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&mut self) -> Result<&Token> {
        let peeked = match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.lexer.next_token()?,
        };
        Ok(&self.peeked.insert(peeked).1)
    }

    fn bump(&mut self) -> Result<(usize, Token)> {
        match self.peeked.take() {
            Some(peeked) => Ok(peeked),
            None => self.lexer.next_token(),
        }
    }

    fn parse_or(&mut self) -> Result<Query> {
        let mut operands = vec![self.parse_and()?];
        while *self.peek()? == Token::Or {
            self.bump()?;
            operands.push(self.parse_and()?);
        }
        Ok(match operands.len() {
            1 => operands.swap_remove(0),
            _ => Query::Or(operands),
        })
    }

    fn parse_and(&mut self) -> Result<Query> {
        let mut operands = vec![self.parse_unary()?];
        while *self.peek()? == Token::And {
            self.bump()?;
            operands.push(self.parse_unary()?);
        }
        Ok(match operands.len() {
            1 => operands.swap_remove(0),
            _ => Query::And(operands),
        })
    }

    fn parse_unary(&mut self) -> Result<Query> {
        let (pos, token) = self.bump()?;
        if self.depth >= MAX_DEPTH {
            return Err(MvMapError::parse(
                pos,
                format!("expression nested deeper than {} levels", MAX_DEPTH),
            ));
        }
        self.depth += 1;
        let query = match token {
            Token::Key(key) => Query::Key(key),
            Token::Not => !self.parse_unary()?,
            Token::Open => {
                let inner = self.parse_or()?;
                match self.bump()? {
                    (_, Token::Close) => inner,
                    (found_at, token) => {
                        return Err(MvMapError::parse(
                            found_at,
                            format!("expected ')' to close '(' at {}, found {}", pos, token),
                        ));
                    }
                }
            }
            token => {
                return Err(MvMapError::parse(
                    pos,
                    format!("expected a key, '!' or '(', found {}", token),
                ));
            }
        };
        self.depth -= 1;
        Ok(query)
    }
}

/// Value ids matched by a query, see [`MvMap::query`].
#[derive(Debug, Clone)]
pub struct MvMapQueryResult<'a> {
    ids: RoaringBitmap,
    values: Arena<'a>,
}

impl<'a> MvMapQueryResult<'a> {
    pub fn len(&self) -> usize {
        self.ids.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The matched value ids.
    pub fn ids(&self) -> &RoaringBitmap {
        &self.ids
    }

    pub fn into_ids(self) -> RoaringBitmap {
        self.ids
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.ids.contains(id)
    }

    /// Whether `value` is among the matched values. Scans the result.
    pub fn contains(&self, value: impl AsRef<[u8]>) -> bool {
        let value = value.as_ref();
        self.iter().any(|v| v == value)
    }

    /// Matched values in id order.
    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        let values = self.values;
        self.ids.iter().map(move |id| values.get(id as usize))
    }
}

struct Evaluator<'a, B: AsRef<[u8]>, H: MvMapHashLoader> {
    map: &'a MvMap<B, H>,
    view: Option<&'a RoaringBitmap>,
    all: Option<RoaringBitmap>,
}

impl<B: AsRef<[u8]>, H: MvMapHashLoader> Evaluator<'_, B, H> {
    /// Complement universe: the view if there is one, otherwise every value.
    fn universe(&mut self) -> &RoaringBitmap {
        if let Some(view) = self.view {
            return view;
        }
        let num_values = self.map.num_values() as u32;
        self.all.get_or_insert_with(|| {
            let mut all = RoaringBitmap::new();
            all.insert_range(0..num_values);
            all
        })
    }

    fn key_cost(&self, query: &Query) -> usize {
        match query {
            Query::Key(key) => self.map.get_ids(key).map_or(0, |ids| ids.len()),
            _ => usize::MAX,
        }
    }

    fn eval(&mut self, query: &Query) -> RoaringBitmap {
        match query {
            Query::Key(key) => self
                .map
                .get_ids(key)
                .map(|ids| ids.collect())
                .unwrap_or_default(),
            Query::Not(inner) => {
                let inner = self.eval(inner);
                self.universe() - inner
            }
            Query::Or(operands) => {
                let mut acc = RoaringBitmap::new();
                for q in operands {
                    acc |= self.eval(q);
                }
                acc
            }
            Query::And(operands) => {
                let mut ordered: Vec<(usize, &Query)> =
                    operands.iter().map(|q| (self.key_cost(q), q)).collect();
                ordered.sort_by_key(|(cost, _)| *cost);
                let mut ordered = ordered.into_iter();
                let Some((_, first)) = ordered.next() else {
                    return self.universe().clone();
                };
                let mut acc = self.eval(first);
                for (_, q) in ordered {
                    if acc.is_empty() {
                        break;
                    }
                    acc &= self.eval(q);
                }
                acc
            }
        }
    }
}

impl<B: AsRef<[u8]>, H: MvMapHashLoader> MvMap<B, H> {
    /// Evaluates `query`, optionally restricted to `view`.
    ///
    /// Without a view, `!` complements against every value of the map, which
    /// costs time proportional to the number of distinct values.
    ///
    /// # Errors
    ///
    /// Returns [`MvMapError::ViewMismatch`] if `view` was built by another map.
    pub fn query(&self, query: &Query, view: Option<&MvMapView>) -> Result<MvMapQueryResult<'_>> {
        let view = view.map(|view| view.check(self)).transpose()?;
        let mut evaluator = Evaluator {
            map: self,
            view,
            all: None,
        };
        let mut ids = evaluator.eval(query);
        if let Some(view) = view {
            ids &= view;
        }
        tracing::trace!(query = %query, matched = ids.len(), "evaluated mvmap query");
        Ok(MvMapQueryResult {
            ids,
            values: self.value_arena(),
        })
    }

    /// Parses `text` and evaluates it, see [`Query::parse`] and
    /// [`query`](Self::query).
    pub fn query_str(&self, text: &str, view: Option<&MvMapView>) -> Result<MvMapQueryResult<'_>> {
        let query = Query::parse(text)?;
        self.query(&query, view)
    }
}
