//! JSON text frames exchanged over the session channels.
//!
//! Inbound frames are small flat objects, so the parser walks them with
//! `winnow` combinators over `&str` and keeps only the members it needs,
//! skipping everything else (nested values included, up to a fixed depth).
//! No allocation; escaped strings decode into bounded buffers.

use core::fmt::{self, Write as _};

use heapless::String;
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, delimited, opt, preceded, repeat};
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::{any, one_of, take_while};

use crate::actuator::{MotorId, MotorIntent};
use crate::dispatch::{ParamKind, Verb};

/// Capacity of encoded reply frames.
pub const REPLY_CAPACITY: usize = 128;

/// Longest decoded string the parser compares against (verb names, numbers).
const TOKEN_CAPACITY: usize = 32;

/// Nesting allowed inside ignored members.
const MAX_DEPTH: u8 = 4;

/// Encoded `{"result": ...}` frame.
pub type Reply = String<REPLY_CAPACITY>;

type PResult<T> = Result<T, ContextError>;

/// Malformed inbound frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtocolError {
    /// The text is not a JSON object.
    Syntax,
    /// A required member is absent.
    MissingField(&'static str),
    /// The member is present but not an integer or numeric string.
    InvalidNumber(&'static str),
    /// `cmd` does not name a known verb.
    UnknownVerb,
    /// The verb needs a parameter and none was supplied.
    MissingParam(Verb),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Syntax => f.write_str("malformed JSON object"),
            ProtocolError::MissingField(field) => write!(f, "missing `{field}`"),
            ProtocolError::InvalidNumber(field) => write!(f, "`{field}` is not an integer"),
            ProtocolError::UnknownVerb => f.write_str("unknown command"),
            ProtocolError::MissingParam(verb) => write!(f, "{verb} requires a parameter"),
        }
    }
}

/// Decoded control-channel frame `{"cmd": .., "param": ..}`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ControlRequest {
    pub verb: Verb,
    pub param: Option<i32>,
}

/// Decoded telemetry-channel frame `{"m1": .., "m2": ..}`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MotorFrame {
    pub m1: i32,
    pub m2: i32,
}

impl MotorFrame {
    /// Left motor takes `m1`, right motor `m2`.
    pub const fn intents(self) -> [MotorIntent; 2] {
        [
            MotorIntent::new(MotorId::Left, self.m1),
            MotorIntent::new(MotorId::Right, self.m2),
        ]
    }
}

/// Parses a control frame. Unknown members are ignored.
pub fn decode_control(text: &str) -> Result<ControlRequest, ProtocolError> {
    let mut cmd = None;
    let mut param = None;
    parse_object(text, |key, value| {
        if key_is(key, "cmd") {
            cmd = Some(value);
        } else if key_is(key, "param") {
            param = Some(value);
        }
    })?;

    let verb = match cmd.ok_or(ProtocolError::MissingField("cmd"))? {
        Value::Str(raw) => unescape::<TOKEN_CAPACITY>(raw)
            .as_deref()
            .and_then(Verb::from_wire_name)
            .ok_or(ProtocolError::UnknownVerb)?,
        _ => return Err(ProtocolError::UnknownVerb),
    };

    let param = match verb.param_kind() {
        ParamKind::None => None,
        ParamKind::Optional | ParamKind::Required => match param {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.integer().ok_or(ProtocolError::InvalidNumber("param"))?),
        },
    };

    if verb.requires_param() && param.is_none() {
        return Err(ProtocolError::MissingParam(verb));
    }

    Ok(ControlRequest { verb, param })
}

/// Parses a telemetry frame. Both members are required.
pub fn decode_motor_frame(text: &str) -> Result<MotorFrame, ProtocolError> {
    let mut m1 = None;
    let mut m2 = None;
    parse_object(text, |key, value| {
        if key_is(key, "m1") {
            m1 = Some(value);
        } else if key_is(key, "m2") {
            m2 = Some(value);
        }
    })?;

    let field = |value: Option<Value<'_>>, name: &'static str| {
        value
            .ok_or(ProtocolError::MissingField(name))?
            .integer()
            .ok_or(ProtocolError::InvalidNumber(name))
    };

    Ok(MotorFrame {
        m1: field(m1, "m1")?,
        m2: field(m2, "m2")?,
    })
}

/// Encodes `{"result": "<text>"}` with JSON string escaping.
///
/// Text that does not fit is cut at a character boundary.
#[must_use]
pub fn encode_result(text: &str) -> Reply {
    const PREFIX: &str = "{\"result\": \"";
    const SUFFIX: &str = "\"}";

    let mut reply = Reply::new();
    let _ = reply.write_str(PREFIX);
    let budget = REPLY_CAPACITY - SUFFIX.len();

    let mut escaped: String<8> = String::new();
    for ch in text.chars() {
        escaped.clear();
        let _ = match ch {
            '"' => escaped.write_str("\\\""),
            '\\' => escaped.write_str("\\\\"),
            '\n' => escaped.write_str("\\n"),
            '\r' => escaped.write_str("\\r"),
            '\t' => escaped.write_str("\\t"),
            ch if ch.is_control() => write!(escaped, "\\u{:04x}", u32::from(ch)),
            ch => escaped.write_char(ch),
        };
        if reply.len() + escaped.len() > budget {
            break;
        }
        let _ = reply.write_str(&escaped);
    }

    let _ = reply.write_str(SUFFIX);
    reply
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Value<'a> {
    /// Raw string contents, escapes still encoded.
    Str(&'a str),
    Number(i32),
    Null,
    Other,
}

impl Value<'_> {
    fn integer(self) -> Option<i32> {
        match self {
            Value::Number(value) => Some(value),
            Value::Str(raw) => {
                let text = unescape::<TOKEN_CAPACITY>(raw)?;
                delimited(multispace0, number, multispace0)
                    .parse(text.as_str())
                    .ok()
            }
            Value::Null | Value::Other => None,
        }
    }
}

fn parse_object<'a>(
    text: &'a str,
    mut on_member: impl FnMut(&'a str, Value<'a>),
) -> Result<(), ProtocolError> {
    let mut input = text;
    delimited(multispace0, |i: &mut &'a str| object(i, MAX_DEPTH, &mut on_member), multispace0)
        .parse_next(&mut input)
        .map_err(|_| ProtocolError::Syntax)?;
    if input.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::Syntax)
    }
}

fn object<'a>(
    input: &mut &'a str,
    depth: u8,
    on_member: &mut dyn FnMut(&'a str, Value<'a>),
) -> PResult<()> {
    ('{', multispace0).parse_next(input)?;
    if opt('}').parse_next(input)?.is_some() {
        return Ok(());
    }
    loop {
        let key = string_raw.parse_next(input)?;
        (multispace0, ':', multispace0).parse_next(input)?;
        let value = value(input, depth)?;
        on_member(key, value);
        multispace0.parse_next(input)?;
        if one_of([',', '}']).parse_next(input)? == '}' {
            return Ok(());
        }
        multispace0.parse_next(input)?;
    }
}

fn array(input: &mut &str, depth: u8) -> PResult<()> {
    ('[', multispace0).parse_next(input)?;
    if opt(']').parse_next(input)?.is_some() {
        return Ok(());
    }
    loop {
        value(input, depth)?;
        multispace0.parse_next(input)?;
        if one_of([',', ']']).parse_next(input)? == ']' {
            return Ok(());
        }
        multispace0.parse_next(input)?;
    }
}

fn value<'a>(input: &mut &'a str, depth: u8) -> PResult<Value<'a>> {
    match input.chars().next() {
        Some('"') => string_raw.map(Value::Str).parse_next(input),
        Some('{') if depth > 0 => {
            object(input, depth - 1, &mut |_, _| {})?;
            Ok(Value::Other)
        }
        Some('[') if depth > 0 => {
            array(input, depth - 1)?;
            Ok(Value::Other)
        }
        Some('t' | 'f' | 'n') => alt((
            "true".value(Value::Other),
            "false".value(Value::Other),
            "null".value(Value::Null),
        ))
        .parse_next(input),
        Some('-' | '0'..='9') => number.map(Value::Number).parse_next(input),
        _ => Err(ContextError::new()),
    }
}

/// Matches a quoted string and returns its raw contents.
fn string_raw<'a>(input: &mut &'a str) -> PResult<&'a str> {
    delimited(
        '"',
        repeat(
            0..,
            alt((
                take_while(1.., |c: char| c != '"' && c != '\\').void(),
                ('\\', any).void(),
            )),
        )
        .map(|()| ())
        .take(),
        '"',
    )
    .parse_next(input)
}

/// JSON number truncated toward zero and saturated to `i32`.
fn number(input: &mut &str) -> PResult<i32> {
    (
        opt('-'),
        digit1,
        opt(preceded('.', digit1)),
        opt(preceded(
            one_of(['e', 'E']),
            (opt(one_of(['+', '-'])), digit1),
        )),
    )
        .map(|(sign, integer, fraction, exponent)| {
            let exponent = exponent.map_or(0, |(exp_sign, digits): (Option<char>, &str)| {
                let magnitude = digits.bytes().fold(0i32, |acc, digit| {
                    acc.saturating_mul(10).saturating_add(i32::from(digit - b'0'))
                });
                if exp_sign == Some('-') {
                    -magnitude
                } else {
                    magnitude
                }
            });
            truncate_decimal(sign.is_some(), integer, fraction.unwrap_or(""), exponent)
        })
        .parse_next(input)
}

fn truncate_decimal(negative: bool, integer: &str, fraction: &str, exponent: i32) -> i32 {
    const SATURATED: i64 = 2_147_483_648;
    const MANTISSA_LIMIT: i64 = 100_000_000_000_000_000;

    let fraction_len = i32::try_from(fraction.len()).unwrap_or(i32::MAX);
    let mut scale = exponent.saturating_sub(fraction_len);
    let mut mantissa: i64 = 0;
    for digit in integer.bytes().chain(fraction.bytes()) {
        if mantissa >= MANTISSA_LIMIT {
            scale = scale.saturating_add(1);
        } else {
            mantissa = mantissa * 10 + i64::from(digit - b'0');
        }
    }

    while scale > 0 && mantissa != 0 && mantissa < SATURATED {
        mantissa *= 10;
        scale -= 1;
    }
    while scale < 0 && mantissa != 0 {
        mantissa /= 10;
        scale += 1;
    }

    let magnitude = mantissa.min(SATURATED);
    let signed = if negative { -magnitude } else { magnitude };
    i32::try_from(signed.clamp(i64::from(i32::MIN), i64::from(i32::MAX))).unwrap_or(0)
}

fn key_is(raw: &str, expected: &str) -> bool {
    if raw.contains('\\') {
        unescape::<TOKEN_CAPACITY>(raw).is_some_and(|key| key == expected)
    } else {
        raw == expected
    }
}

/// Decodes JSON escapes. `None` on bad escapes or overflow.
fn unescape<const N: usize>(raw: &str) -> Option<String<N>> {
    let mut out = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        let decoded = if ch == '\\' {
            match chars.next()? {
                '"' => '"',
                '\\' => '\\',
                '/' => '/',
                'b' => '\u{8}',
                'f' => '\u{c}',
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                'u' => {
                    let mut code = 0u32;
                    for _ in 0..4 {
                        code = code * 16 + chars.next()?.to_digit(16)?;
                    }
                    char::from_u32(code)?
                }
                _ => return None,
            }
        } else {
            ch
        };
        out.push(decoded).ok()?;
    }
    Some(out)
}
