use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use time::OffsetDateTime;

use crate::error::GatewayError;

/// Reduction applied over a series when querying the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Last,
    Mean,
}

impl Aggregator {
    pub fn function(&self) -> &'static str {
        match self {
            Aggregator::Last => "last",
            Aggregator::Mean => "mean",
        }
    }
}

/// A relative time window such as `5m` or `1h`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeExpr {
    amount: u32,
    unit: char,
}

impl RangeExpr {
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let raw = raw.trim();
        let invalid = || GatewayError::InvalidRange(raw.to_string());

        let unit = raw.chars().last().ok_or_else(invalid)?;
        if !matches!(unit, 's' | 'm' | 'h' | 'd' | 'w') {
            return Err(invalid());
        }
        let digits = &raw[..raw.len() - unit.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let amount: u32 = digits.parse().map_err(|_| invalid())?;
        if amount == 0 {
            return Err(invalid());
        }
        Ok(Self { amount, unit })
    }

}

impl fmt::Display for RangeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit)
    }
}

impl Serialize for RangeExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RangeExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RangeExpr::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Conjunction of tag equality clauses, written `"tag" = 'value' AND ...`.
///
/// Only equality on tags joined by `AND` is accepted; the filter is rendered back
/// with its own escaping so stored text never reaches the store verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    clauses: Vec<(String, String)>,
}

impl TagFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { clauses: vec![(key.into(), value.into())] }
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push((key.into(), value.into()));
        self
    }

    /// Parses a filter; an empty or blank string means "no filter".
    pub fn parse_optional(raw: &str) -> Result<Option<Self>, GatewayError> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        FilterParser { src: raw, pos: 0 }.parse().map(Some)
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "\"{}\" = '{}'", escape(key, '"'), escape(value, '\''))?;
        }
        Ok(())
    }
}

fn escape(raw: &str, quote: char) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || c == quote {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

struct FilterParser<'a> {
    src: &'a str,
    pos: usize,
}

impl FilterParser<'_> {
    fn parse(mut self) -> Result<TagFilter, GatewayError> {
        let mut clauses = Vec::new();
        loop {
            self.skip_ws();
            let key = self.key()?;
            self.skip_ws();
            self.expect('=', "expected `=` after tag key")?;
            self.skip_ws();
            let value = self.quoted('\'', "expected a single-quoted tag value")?;
            clauses.push((key, value));

            self.skip_ws();
            if self.rest().is_empty() {
                return Ok(TagFilter { clauses });
            }
            self.keyword_and()?;
        }
    }

    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn fail(&self, reason: &'static str) -> GatewayError {
        GatewayError::InvalidFilter { filter: self.src.to_string(), reason }
    }

    fn expect(&mut self, c: char, reason: &'static str) -> Result<(), GatewayError> {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(self.fail(reason))
        }
    }

    fn key(&mut self) -> Result<String, GatewayError> {
        if self.rest().starts_with('"') {
            return self.quoted('"', "unterminated tag key");
        }
        let len = self
            .rest()
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(self.rest().len());
        if len == 0 {
            return Err(self.fail("expected a tag key"));
        }
        let key = self.rest()[..len].to_string();
        self.pos += len;
        Ok(key)
    }

    fn quoted(&mut self, quote: char, reason: &'static str) -> Result<String, GatewayError> {
        self.expect(quote, reason)?;
        let mut out = String::new();
        let mut escaped = false;
        for (offset, c) in self.rest().char_indices() {
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                self.pos += offset + c.len_utf8();
                return Ok(out);
            } else {
                out.push(c);
            }
        }
        Err(self.fail(reason))
    }

    fn keyword_and(&mut self) -> Result<(), GatewayError> {
        let rest = self.rest();
        let is_and = rest.get(..3).is_some_and(|word| word.eq_ignore_ascii_case("and"))
            && rest[3..].starts_with(char::is_whitespace);
        if !is_and {
            return Err(self.fail("clauses must be joined with AND"));
        }
        self.pos += 3;
        Ok(())
    }
}

impl Serialize for TagFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Serde helper for `Option<TagFilter>` fields where `""` and `null` both mean no filter.
pub mod optional_filter {
    use super::TagFilter;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<TagFilter>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => TagFilter::parse_optional(&raw).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// An aggregate lookup against the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesQuery {
    pub aggregator: Aggregator,
    pub measurement: String,
    pub field: String,
    /// `None` means no lower time bound.
    pub range: Option<RangeExpr>,
    pub filter: Option<TagFilter>,
}

/// Value of a queried row. Numbers and strings are both legal field types.
#[derive(Debug, Clone, PartialEq)]
pub enum PointValue {
    Number(f64),
    Text(String),
}

/// Most recent matching row returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPoint {
    pub value: PointValue,
    pub timestamp: OffsetDateTime,
}
