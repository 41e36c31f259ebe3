// ── Cache protocol messages ──
//
// One message per line:
//
//     [time1] [+|-] [time2] [@] key [#] op [value]
//
// The timestamp block is only present when terminated by `@`. `time2` is a
// TTL after `+`, an absolute expiry time after `-`; both are normalized to
// a TTL here.

use std::fmt;

use crate::error::Error;

/// Default TCP port of the cache server.
pub const DEFAULT_CACHE_PORT: u16 = 14869;

/// Key queried after a wildcard request; its `###!` reply marks the end.
pub const END_MARKER: &str = "###";

/// Key used by clients to mark the end of the initial sync burst.
pub const SYNC_MARKER: &str = "#sync#";

/// Key flag that keeps an update out of on-disk stores.
pub const FLAG_NO_STORE: char = '#';

/// Default TTL for locks, in seconds.
pub const DEFAULT_LOCK_TTL: f64 = 1800.0;

/// Protocol operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `=` set a key / report a value
    Tell,
    /// `?` query a single key
    Ask,
    /// `*` query all keys containing a substring
    Wildcard,
    /// `:` subscribe to updates of keys containing a substring
    Subscribe,
    /// `!` value is expired or absent
    TellOld,
    /// `$` lock / unlock an identifier
    Lock,
    /// `~` register a key prefix rewrite
    Rewrite,
}

impl Op {
    pub fn as_char(self) -> char {
        match self {
            Self::Tell => '=',
            Self::Ask => '?',
            Self::Wildcard => '*',
            Self::Subscribe => ':',
            Self::TellOld => '!',
            Self::Lock => '$',
            Self::Rewrite => '~',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '=' => Self::Tell,
            '?' => Self::Ask,
            '*' => Self::Wildcard,
            ':' => Self::Subscribe,
            '!' => Self::TellOld,
            '$' => Self::Lock,
            '~' => Self::Rewrite,
            _ => return None,
        })
    }
}

/// A single protocol line.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// UNIX timestamp of the value (`time1`).
    pub time: Option<f64>,
    /// Time to live in seconds.
    pub ttl: Option<f64>,
    /// Whether the `@` timestamp block was present.
    pub stamped: bool,
    pub key: String,
    /// `#` flag between key and operator.
    pub no_store: bool,
    pub op: Op,
    /// Raw value literal; empty means "no value".
    pub value: String,
}

impl Message {
    fn new(key: impl Into<String>, op: Op, value: impl Into<String>) -> Self {
        Self {
            time: None,
            ttl: None,
            stamped: false,
            key: key.into(),
            no_store: false,
            op,
            value: value.into(),
        }
    }

    /// `key=value`
    pub fn tell(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, Op::Tell, value)
    }

    /// `time+ttl@key=value`
    pub fn tell_at(
        time: f64,
        ttl: Option<f64>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(key, Op::Tell, value).stamped_at(time, ttl)
    }

    /// `[time+ttl@]key!value`
    pub fn tell_old(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, Op::TellOld, value)
    }

    /// `[@]key?`
    pub fn ask(key: impl Into<String>, with_time: bool) -> Self {
        Self {
            stamped: with_time,
            ..Self::new(key, Op::Ask, "")
        }
    }

    /// `[@]key*`
    pub fn wildcard(pattern: impl Into<String>, with_time: bool) -> Self {
        Self {
            stamped: with_time,
            ..Self::new(pattern, Op::Wildcard, "")
        }
    }

    /// `[@]key:`
    pub fn subscribe(pattern: impl Into<String>, with_time: bool) -> Self {
        Self {
            stamped: with_time,
            ..Self::new(pattern, Op::Subscribe, "")
        }
    }

    /// `+ttl@key$+client` or `key$-client`
    pub fn lock(key: impl Into<String>, client: &str, lock: bool, ttl: Option<f64>) -> Self {
        let sign = if lock { '+' } else { '-' };
        let mut msg = Self::new(key, Op::Lock, format!("{sign}{client}"));
        if let Some(ttl) = ttl {
            msg.stamped = true;
            msg.ttl = Some(ttl);
        }
        msg
    }

    /// `key$holder`; an empty holder means the request was granted.
    pub fn lock_reply(key: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::new(key, Op::Lock, holder)
    }

    /// `new_prefix~old_prefix`; an empty `old_prefix` removes the rewrite.
    pub fn rewrite(new_prefix: impl Into<String>, old_prefix: impl Into<String>) -> Self {
        Self::new(new_prefix, Op::Rewrite, old_prefix)
    }

    pub fn stamped_at(mut self, time: f64, ttl: Option<f64>) -> Self {
        self.stamped = true;
        self.time = Some(time);
        self.ttl = ttl;
        self
    }

    pub fn with_no_store(mut self) -> Self {
        self.no_store = true;
        self
    }

    /// The value, or `None` for deletions and bare queries.
    pub fn value(&self) -> Option<&str> {
        if self.value.is_empty() { None } else { Some(&self.value) }
    }

    /// Parse one line (without the trailing newline).
    pub fn parse(line: &str) -> Result<Self, Error> {
        let garbled = || Error::Garbled {
            line: line.to_owned(),
        };
        let line = line.trim_end_matches(['\r', '\n']);

        let (stamp, rest) = match parse_stamp(line) {
            Some((stamp, rest)) => (Some(stamp), rest),
            None => (None, line),
        };

        let (op_idx, op_char) = rest
            .char_indices()
            .find(|(_, c)| Op::from_char(*c).is_some())
            .ok_or_else(garbled)?;
        let op = Op::from_char(op_char).ok_or_else(garbled)?;

        let mut key = rest[..op_idx].trim();
        let mut no_store = false;
        // The flag only means something on updates; `###?` is a plain key.
        if op == Op::Tell {
            if let Some(stripped) = key.strip_suffix(FLAG_NO_STORE) {
                key = stripped.trim_end();
                no_store = true;
            }
        }
        let value = rest[op_idx + op_char.len_utf8()..].trim();

        let mut msg = Self::new(key, op, value);
        msg.no_store = no_store;
        if let Some(stamp) = stamp {
            msg.stamped = true;
            msg.time = stamp.time;
            msg.ttl = match (stamp.ttl_op, stamp.ttl) {
                (_, None) => None,
                ('-', Some(expires)) => Some(expires - stamp.time.ok_or_else(garbled)?),
                (_, Some(ttl)) => Some(ttl),
            };
        }
        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stamped {
            if let Some(time) = self.time {
                write!(f, "{time}")?;
            }
            if let Some(ttl) = self.ttl {
                write!(f, "+{ttl}")?;
            }
            f.write_str("@")?;
        }
        f.write_str(&self.key)?;
        if self.no_store {
            write!(f, "{FLAG_NO_STORE}")?;
        }
        write!(f, "{}{}", self.op.as_char(), self.value)
    }
}

// ── Timestamp block ─────────────────────────────────────────────────

struct Stamp {
    time: Option<f64>,
    ttl_op: char,
    ttl: Option<f64>,
}

/// Try to read `[time] [+|-] [ttl] @` from the start of the line.
fn parse_stamp(line: &str) -> Option<(Stamp, &str)> {
    let mut cursor = Cursor { s: line, pos: 0 };
    cursor.skip_ws();
    let time = cursor.number(false);
    cursor.skip_ws();
    let ttl_op = match cursor.peek() {
        Some(c @ ('+' | '-')) => {
            cursor.pos += 1;
            c
        }
        _ => '+',
    };
    cursor.skip_ws();
    let ttl = cursor.number(true);
    cursor.skip_ws();
    if cursor.peek() != Some('@') {
        return None;
    }
    Some((Stamp { time, ttl_op, ttl }, &line[cursor.pos + 1..]))
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += self.peek().map_or(1, char::len_utf8);
        }
    }

    /// `\d+\.?\d*`, optionally followed by an exponent.
    fn number(&mut self, allow_exponent: bool) -> Option<f64> {
        let start = self.pos;
        let bytes = self.s.as_bytes();
        let digits = |from: usize| {
            bytes[from..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count()
        };

        let int_len = digits(self.pos);
        if int_len == 0 {
            return None;
        }
        self.pos += int_len;
        if bytes.get(self.pos) == Some(&b'.') {
            self.pos += 1;
            self.pos += digits(self.pos);
        }
        if allow_exponent && matches!(bytes.get(self.pos), Some(b'e' | b'E')) {
            let mut p = self.pos + 1;
            if matches!(bytes.get(p), Some(b'+' | b'-')) {
                p += 1;
            }
            let exp_len = digits(p);
            if exp_len > 0 {
                self.pos = p + exp_len;
            }
        }
        self.s[start..self.pos].parse().ok()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_plain_tell() {
        let msg = Message::parse("nicos/temp/setpoint=5").unwrap();
        assert_eq!(msg.key, "nicos/temp/setpoint");
        assert_eq!(msg.op, Op::Tell);
        assert_eq!(msg.value(), Some("5"));
        assert!(!msg.stamped);
    }

    #[test]
    fn parses_time_and_ttl() {
        let msg = Message::parse("1327504784.71+5@nicos/temp/value=5.003").unwrap();
        assert!(msg.stamped);
        assert_eq!(msg.time, Some(1_327_504_784.71));
        assert_eq!(msg.ttl, Some(5.0));
        assert_eq!(msg.value, "5.003");
    }

    #[test]
    fn expiry_form_is_converted_to_ttl() {
        let msg = Message::parse("100-130@nicos/x/value=1").unwrap();
        assert_eq!(msg.time, Some(100.0));
        assert_eq!(msg.ttl, Some(30.0));
    }

    #[test]
    fn ttl_only() {
        let msg = Message::parse("+5@nicos/temp/value=1.102").unwrap();
        assert_eq!(msg.time, None);
        assert_eq!(msg.ttl, Some(5.0));
    }

    #[test]
    fn deletion_has_no_value() {
        let msg = Message::parse("nicos/temp/value=").unwrap();
        assert_eq!(msg.value(), None);
    }

    #[test]
    fn query_forms() {
        let msg = Message::parse("@nicos/temp/value?").unwrap();
        assert_eq!(msg.op, Op::Ask);
        assert!(msg.stamped);
        assert_eq!(msg.time, None);

        let msg = Message::parse("nicos/temp/*").unwrap();
        assert_eq!(msg.op, Op::Wildcard);
        assert_eq!(msg.key, "nicos/temp/");
    }

    #[test]
    fn no_store_flag() {
        let msg = Message::parse("nicos/det/value#=12").unwrap();
        assert!(msg.no_store);
        assert_eq!(msg.key, "nicos/det/value");
        assert_eq!(msg.to_string(), "nicos/det/value#=12");
    }

    #[test]
    fn rewrite_and_lock() {
        let msg = Message::parse("nicos/t~nicos/tcryo").unwrap();
        assert_eq!(msg.op, Op::Rewrite);
        assert_eq!(msg.key, "nicos/t");
        assert_eq!(msg.value, "nicos/tcryo");

        let msg = Message::parse("+60@lock/daemon$+client1").unwrap();
        assert_eq!(msg.op, Op::Lock);
        assert_eq!(msg.ttl, Some(60.0));
        assert_eq!(msg.value, "+client1");
    }

    #[test]
    fn value_may_contain_operators() {
        let msg = Message::parse("nicos/sw/mapping={'a': 1}").unwrap();
        assert_eq!(msg.key, "nicos/sw/mapping");
        assert_eq!(msg.value, "{'a': 1}");
    }

    #[test]
    fn crlf_and_whitespace_are_tolerated() {
        let msg = Message::parse("  nicos/a/value = 3 \r\n").unwrap();
        assert_eq!(msg.key, "nicos/a/value");
        assert_eq!(msg.value, "3");
    }

    #[test]
    fn garbled_line_is_rejected() {
        assert!(matches!(
            Message::parse("no operator here"),
            Err(Error::Garbled { .. })
        ));
        assert!(Message::parse("-5@key=1").is_err());
    }

    #[test]
    fn display_round_trips_stamped_tell() {
        let msg = Message::tell_at(1000.5, Some(6.0), "nicos/m/value", "1.25");
        insta::assert_snapshot!(msg.to_string(), @"1000.5+6@nicos/m/value=1.25");
        assert_eq!(Message::parse(&msg.to_string()).unwrap(), msg);
    }
}
