//! Wire encodings: command templates for message-based instruments and
//! register layouts for Modbus devices.

use super::domain::Domain;
use super::value::Value;
use crate::error::{InstrError, InstrResult};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Matches `{value}` and `{value:<spec>}` placeholders.
static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{value(?::([^}]*))?\}").expect("Invalid placeholder regex")
});

/// How a value is rendered into a command template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatSpec {
    /// Natural rendering (shortest float repr, decimal ints, enum code, bool word).
    Plain,
    /// Fixed number of decimals, `.3`.
    Fixed(usize),
    /// Scientific notation, `e`.
    Scientific,
    /// Integer with optional zero padding, `d` / `04d`.
    Decimal(usize),
    /// Upper-case hex with optional zero padding, `X` / `04X`.
    UpperHex(usize),
    /// Lower-case hex with optional zero padding, `x` / `04x`.
    LowerHex(usize),
}

impl FormatSpec {
    fn parse(spec: &str) -> InstrResult<Self> {
        let width = |suffix: char| -> InstrResult<usize> {
            let digits = spec.trim_end_matches(suffix).trim_start_matches('0');
            if digits.is_empty() {
                Ok(0)
            } else {
                digits.parse::<usize>().map_err(|_| {
                    InstrError::Configuration(format!("bad width in format spec '{}'", spec))
                })
            }
        };
        match spec {
            "" => Ok(FormatSpec::Plain),
            "e" | "E" => Ok(FormatSpec::Scientific),
            s if s.starts_with('.') => s[1..]
                .parse::<usize>()
                .map(FormatSpec::Fixed)
                .map_err(|_| InstrError::Configuration(format!("bad precision in '{}'", spec))),
            s if s.ends_with('d') => width('d').map(FormatSpec::Decimal),
            s if s.ends_with('X') => width('X').map(FormatSpec::UpperHex),
            s if s.ends_with('x') => width('x').map(FormatSpec::LowerHex),
            _ => Err(InstrError::Configuration(format!(
                "Unknown format specifier: {}",
                spec
            ))),
        }
    }

    fn render_number(&self, value: f64, integral: bool) -> String {
        match self {
            FormatSpec::Plain if integral => format!("{}", value as i64),
            FormatSpec::Plain => format!("{}", value),
            FormatSpec::Fixed(decimals) => format!("{:.*}", *decimals, value),
            FormatSpec::Scientific => format!("{:e}", value),
            FormatSpec::Decimal(width) => format!("{:0width$}", value.round() as i64, width = *width),
            FormatSpec::UpperHex(width) => {
                format!("{:0width$X}", hex_bits(value), width = *width)
            }
            FormatSpec::LowerHex(width) => {
                format!("{:0width$x}", hex_bits(value), width = *width)
            }
        }
    }
}

/// Bit pattern shown for a hex placeholder. Negative values that fit 32 bits
/// are shown as their 32-bit two's complement, anything wider as 64 bits.
fn hex_bits(value: f64) -> u64 {
    let v = value.round() as i64;
    match i32::try_from(v) {
        Ok(narrow) if narrow < 0 => u64::from(narrow as u32),
        _ => v as u64,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(FormatSpec),
}

/// A parsed command template such as `"FREQ {value:.3}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> InstrResult<Self> {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER_REGEX.captures_iter(raw) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                segments.push(Segment::Literal(raw[last..whole.start()].to_string()));
            }
            let spec = caps.get(1).map_or("", |m| m.as_str());
            segments.push(Segment::Value(FormatSpec::parse(spec)?));
            last = whole.end();
        }
        if last < raw.len() {
            segments.push(Segment::Literal(raw[last..].to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_placeholder(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Value(_)))
    }
}

impl Serialize for Template {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// Encoding for message-based (SCPI-like) instruments.
#[derive(Debug, Clone, Serialize)]
pub struct TextCodec {
    pub query: Option<Template>,
    pub assign: Option<Template>,
    /// Narrows a reply to its first capture group before decoding.
    #[serde(serialize_with = "serialize_regex")]
    pub reply: Option<Regex>,
    pub true_word: String,
    pub false_word: String,
}

fn serialize_regex<S: serde::Serializer>(re: &Option<Regex>, s: S) -> Result<S::Ok, S::Error> {
    match re {
        Some(re) => s.serialize_some(re.as_str()),
        None => s.serialize_none(),
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        Self {
            query: None,
            assign: None,
            reply: None,
            true_word: "ON".to_string(),
            false_word: "OFF".to_string(),
        }
    }
}

impl TextCodec {
    /// Renders the assignment command for `value`.
    pub fn encode_assignment(
        &self,
        feature: &str,
        domain: &Domain,
        value: &Value,
    ) -> InstrResult<Vec<u8>> {
        let template = self.assign.as_ref().ok_or_else(|| InstrError::Direction {
            feature: feature.to_string(),
            operation: "assignment",
        })?;
        let mut out = Vec::new();
        for segment in &template.segments {
            match segment {
                Segment::Literal(text) => out.extend_from_slice(text.as_bytes()),
                Segment::Value(spec) => self.render_value(feature, domain, value, spec, &mut out)?,
            }
        }
        Ok(out)
    }

    pub fn query_command(&self, feature: &str) -> InstrResult<Vec<u8>> {
        self.query
            .as_ref()
            .map(|t| t.as_str().as_bytes().to_vec())
            .ok_or_else(|| InstrError::Direction {
                feature: feature.to_string(),
                operation: "query",
            })
    }

    fn render_value(
        &self,
        feature: &str,
        domain: &Domain,
        value: &Value,
        spec: &FormatSpec,
        out: &mut Vec<u8>,
    ) -> InstrResult<()> {
        let text = match (domain, value) {
            (Domain::Bool, Value::Bool(b)) => {
                if *b {
                    self.true_word.clone()
                } else {
                    self.false_word.clone()
                }
            }
            (Domain::Enum { labels }, Value::Text(label)) => labels
                .code_for(label)
                .map(str::to_string)
                .ok_or_else(|| InstrError::domain(feature, format!("unknown label '{}'", label)))?,
            (_, Value::Int(v)) => spec.render_number(*v as f64, true),
            (_, Value::Float(v)) => spec.render_number(*v, false),
            (_, Value::Text(v)) => v.clone(),
            (_, Value::Bytes(data)) => {
                write_definite_block(data, out);
                return Ok(());
            }
            (_, other) => {
                return Err(InstrError::domain(
                    feature,
                    format!("{} value cannot fill a template", other.shape()),
                ))
            }
        };
        out.extend_from_slice(text.as_bytes());
        Ok(())
    }

    /// Decodes a reply into a value of `domain`.
    pub fn decode(&self, feature: &str, domain: &Domain, reply: &[u8]) -> InstrResult<Value> {
        if let Domain::Bytes { .. } = domain {
            return read_definite_block(reply).map(Value::Bytes);
        }
        let full = crate::transport::reply_text(reply)?;
        let text = match &self.reply {
            Some(re) => {
                let caps = re.captures(&full).ok_or_else(|| {
                    InstrError::protocol(format!(
                        "reply '{}' to '{}' does not match /{}/",
                        full,
                        feature,
                        re.as_str()
                    ))
                })?;
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map_or("", |m| m.as_str())
                    .trim()
                    .to_string()
            }
            None => full,
        };
        let undecodable = |what: &str| {
            InstrError::protocol(format!("cannot decode '{}' as {} for '{}'", text, what, feature))
        };
        match domain {
            Domain::Action => Ok(Value::Unit),
            Domain::Bool => {
                if text == "1" || text.eq_ignore_ascii_case(&self.true_word) {
                    Ok(Value::Bool(true))
                } else if text == "0" || text.eq_ignore_ascii_case(&self.false_word) {
                    Ok(Value::Bool(false))
                } else {
                    Err(undecodable("bool"))
                }
            }
            Domain::Int { .. } => parse_int(&text).map(Value::Int).ok_or_else(|| undecodable("int")),
            Domain::Float { .. } => text
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| undecodable("float")),
            Domain::Enum { labels } => labels
                .label_for(&text)
                .map(|label| Value::Text(label.to_string()))
                .ok_or_else(|| undecodable("enum code")),
            Domain::Text { .. } => Ok(Value::Text(text)),
            Domain::Bytes { .. } => Err(undecodable("bytes")),
        }
    }
}

/// Accepts `42`, `+42` and integral floats such as `+4.200000E+01`.
fn parse_int(text: &str) -> Option<i64> {
    if let Ok(v) = text.parse::<i64>() {
        return Some(v);
    }
    let f = text.parse::<f64>().ok()?;
    (f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}

/// IEEE 488.2 definite-length arbitrary block: `#<n><len><data>`.
fn write_definite_block(data: &[u8], out: &mut Vec<u8>) {
    let len = data.len().to_string();
    out.push(b'#');
    out.extend_from_slice(len.len().to_string().as_bytes());
    out.extend_from_slice(len.as_bytes());
    out.extend_from_slice(data);
}

fn read_definite_block(reply: &[u8]) -> InstrResult<Vec<u8>> {
    let Some(start) = reply.iter().position(|b| *b == b'#') else {
        return Ok(reply.to_vec());
    };
    let header = &reply[start..];
    let digits = header
        .get(1)
        .and_then(|d| (*d as char).to_digit(10))
        .filter(|d| *d > 0)
        .ok_or_else(|| InstrError::protocol("malformed block header"))? as usize;
    let len_field = header
        .get(2..2 + digits)
        .ok_or_else(|| InstrError::protocol("truncated block header"))?;
    let len: usize = std::str::from_utf8(len_field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| InstrError::protocol("malformed block length"))?;
    header
        .get(2 + digits..2 + digits + len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| InstrError::protocol(format!("block shorter than {} bytes", len)))
}

/// Number of 16-bit words a register value spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterWidth {
    One,
    Two,
}

impl RegisterWidth {
    pub fn words(self) -> u16 {
        match self {
            RegisterWidth::One => 1,
            RegisterWidth::Two => 2,
        }
    }
}

/// Which Modbus table a register lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterBank {
    /// Read with 0x03, written with 0x06/0x10.
    Holding,
    /// Read-only, read with 0x04.
    Input,
}

/// Encoding for one value stored in Modbus registers.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterCodec {
    pub address: u16,
    pub width: RegisterWidth,
    pub signed: bool,
    /// Fixed-point decimals: wire value is `round(v · 10^n)`.
    pub decimals: u32,
    pub bank: RegisterBank,
}

/// Splits a 32-bit two's-complement integer into two words, high word first.
pub fn split_i32(value: i32) -> [u16; 2] {
    let raw = value as u32;
    [(raw >> 16) as u16, (raw & 0xFFFF) as u16]
}

/// Inverse of [`split_i32`].
pub fn compose_i32(high: u16, low: u16) -> i32 {
    (((high as u32) << 16) | low as u32) as i32
}

impl RegisterCodec {
    fn scale(&self) -> f64 {
        10f64.powi(self.decimals as i32)
    }

    fn raw_bounds(&self) -> (i64, i64) {
        match (self.width, self.signed) {
            (RegisterWidth::One, true) => (i16::MIN as i64, i16::MAX as i64),
            (RegisterWidth::One, false) => (0, u16::MAX as i64),
            (RegisterWidth::Two, true) => (i32::MIN as i64, i32::MAX as i64),
            (RegisterWidth::Two, false) => (0, u32::MAX as i64),
        }
    }

    /// Encodes a domain-checked value into register words.
    pub fn encode(&self, feature: &str, domain: &Domain, value: &Value) -> InstrResult<Vec<u16>> {
        let raw: i64 = match (domain, value) {
            (Domain::Bool, Value::Bool(b)) => i64::from(*b),
            (Domain::Enum { labels }, Value::Text(label)) => labels
                .code_for(label)
                .and_then(|code| code.trim().parse::<i64>().ok())
                .ok_or_else(|| {
                    InstrError::Configuration(format!(
                        "enum code for '{}' on '{}' is not numeric",
                        label, feature
                    ))
                })?,
            (_, Value::Int(v)) if self.decimals == 0 => *v,
            (_, v @ (Value::Int(_) | Value::Float(_))) => {
                let scaled = (v.as_f64().unwrap_or(f64::NAN) * self.scale()).round();
                if !scaled.is_finite() {
                    return Err(InstrError::domain(feature, "value is not finite"));
                }
                scaled as i64
            }
            (_, other) => {
                return Err(InstrError::domain(
                    feature,
                    format!("{} value cannot be stored in registers", other.shape()),
                ))
            }
        };
        let (min, max) = self.raw_bounds();
        if raw < min || raw > max {
            return Err(InstrError::domain(
                feature,
                format!("raw value {} does not fit the register range [{}, {}]", raw, min, max),
            ));
        }
        Ok(match self.width {
            RegisterWidth::One => vec![raw as u16],
            RegisterWidth::Two => split_i32(raw as u32 as i32).to_vec(),
        })
    }

    /// Decodes register words into a value of `domain`.
    pub fn decode(&self, feature: &str, domain: &Domain, words: &[u16]) -> InstrResult<Value> {
        let raw: i64 = match (self.width, words) {
            (RegisterWidth::One, [w]) if self.signed => *w as i16 as i64,
            (RegisterWidth::One, [w]) => *w as i64,
            (RegisterWidth::Two, [hi, lo]) if self.signed => compose_i32(*hi, *lo) as i64,
            (RegisterWidth::Two, [hi, lo]) => compose_i32(*hi, *lo) as u32 as i64,
            _ => {
                return Err(InstrError::protocol(format!(
                    "'{}' expects {} register(s), got {}",
                    feature,
                    self.width.words(),
                    words.len()
                )))
            }
        };
        match domain {
            Domain::Bool => Ok(Value::Bool(raw != 0)),
            Domain::Enum { labels } => labels
                .label_for(&raw.to_string())
                .map(|label| Value::Text(label.to_string()))
                .ok_or_else(|| {
                    InstrError::protocol(format!("'{}' has no label for code {}", feature, raw))
                }),
            Domain::Float { .. } => Ok(Value::Float(raw as f64 / self.scale())),
            Domain::Int { .. } => Ok(Value::Int(raw)),
            other => Err(InstrError::Configuration(format!(
                "'{}' cannot decode registers into {}",
                feature,
                other.shape_name()
            ))),
        }
    }
}

/// Wire encoding of a feature.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Encoding {
    Text(TextCodec),
    Register(RegisterCodec),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(assign: &str) -> TextCodec {
        TextCodec {
            query: Some(Template::parse("X?").unwrap()),
            assign: Some(Template::parse(assign).unwrap()),
            ..TextCodec::default()
        }
    }

    #[test]
    fn template_rendering() {
        let d = Domain::any_float();
        let c = codec("FREQ {value}");
        assert_eq!(
            c.encode_assignment("f", &d, &Value::Float(1e4)).unwrap(),
            b"FREQ 10000".to_vec()
        );
        let c = codec("VOLT {value:.3}");
        assert_eq!(
            c.encode_assignment("v", &d, &Value::Float(2.0)).unwrap(),
            b"VOLT 2.000".to_vec()
        );
        let c = codec("PA{value:04X}");
        assert_eq!(
            c.encode_assignment("p", &Domain::signed(32), &Value::Int(255)).unwrap(),
            b"PA00FF".to_vec()
        );
    }

    #[test]
    fn hex_covers_full_unsigned_range() {
        let d = Domain::signed(64);
        let c = codec("M{value:08X}");
        assert_eq!(
            c.encode_assignment("m", &d, &Value::Int(0xFFFF_FFFF)).unwrap(),
            b"MFFFFFFFF".to_vec()
        );
        assert_eq!(
            c.encode_assignment("m", &d, &Value::Int(0x8000_0000)).unwrap(),
            b"M80000000".to_vec()
        );
        assert_eq!(
            c.encode_assignment("m", &d, &Value::Int(-2)).unwrap(),
            b"MFFFFFFFE".to_vec()
        );
        let c = codec("m{value:x}");
        assert_eq!(
            c.encode_assignment("m", &d, &Value::Int(0x1_0000_0000)).unwrap(),
            b"m100000000".to_vec()
        );
    }

    #[test]
    fn unknown_format_spec_is_configuration_error() {
        let err = Template::parse("X {value:q}").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn bool_and_enum_words() {
        let c = codec("OUTP {value}");
        assert_eq!(
            c.encode_assignment("o", &Domain::Bool, &Value::Bool(true)).unwrap(),
            b"OUTP ON".to_vec()
        );
        assert_eq!(
            c.decode("o", &Domain::Bool, b"1\n").unwrap(),
            Value::Bool(true)
        );
        let shapes = Domain::enumeration([("sin", "SIN"), ("square", "SQU")]);
        assert_eq!(
            c.encode_assignment("s", &shapes, &Value::from("square")).unwrap(),
            b"OUTP SQU".to_vec()
        );
        assert_eq!(c.decode("s", &shapes, b"SIN\n").unwrap(), Value::from("sin"));
    }

    #[test]
    fn reply_regex_narrows() {
        let c = TextCodec {
            reply: Some(Regex::new(r"TP\s*([-+0-9.eE]+)").unwrap()),
            ..codec("PA {value}")
        };
        assert_eq!(
            c.decode("pos", &Domain::any_float(), b"1TP 12.5\r\n").unwrap(),
            Value::Float(12.5)
        );
        assert!(c.decode("pos", &Domain::any_float(), b"garbage").is_err());
    }

    #[test]
    fn int_replies_in_scientific_notation() {
        let c = codec("N {value}");
        assert_eq!(
            c.decode("n", &Domain::signed(16), b"+5.000000E+01").unwrap(),
            Value::Int(50)
        );
    }

    #[test]
    fn definite_length_blocks() {
        let c = codec("DATA {value}");
        let encoded = c
            .encode_assignment("d", &Domain::bytes(), &Value::Bytes(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(encoded, b"DATA #13\x01\x02\x03".to_vec());
        assert_eq!(
            c.decode("d", &Domain::bytes(), b"#15hello\n").unwrap(),
            Value::Bytes(b"hello".to_vec())
        );
    }

    #[test]
    fn signed_32_boundaries() {
        for v in [i32::MIN, -1, 0, 1, i32::MAX, -123_456, 70_000] {
            let [hi, lo] = split_i32(v);
            assert_eq!(compose_i32(hi, lo), v);
        }
        assert_eq!(split_i32(-1), [0xFFFF, 0xFFFF]);
        assert_eq!(split_i32(65_536), [1, 0]);
    }

    #[test]
    fn scaled_register_values() {
        let codec = RegisterCodec {
            address: 10,
            width: RegisterWidth::One,
            signed: true,
            decimals: 2,
            bank: RegisterBank::Holding,
        };
        let d = Domain::any_float();
        assert_eq!(codec.encode("s", &d, &Value::Float(1.23)).unwrap(), vec![123]);
        assert_eq!(codec.decode("s", &d, &[123]).unwrap(), Value::Float(1.23));
        assert_eq!(
            codec.encode("s", &d, &Value::Float(-1.5)).unwrap(),
            vec![(-150i16) as u16]
        );
        assert!(codec.encode("s", &d, &Value::Float(400.0)).is_err());
    }
}
