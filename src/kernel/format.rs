//! String formatting with mediated field access.
//!
//! `str.format` is a classic confinement escape: a template such as
//! `"{0.__class__.__subclasses__}"` walks attributes without any attribute
//! syntax in the program text. Here every `.attr` step of a replacement
//! field goes through [`mediator::getattr`], so templates can reach exactly
//! what attribute syntax could.

use super::mediator;
use super::store::MapKey;
use super::value::Value;
use crate::interp::{EvalResult, Interpreter, index_error, key_error, type_error, value_error};
use crate::interp::{float_repr, str_repr};

/// `template.format(*args, **named)` with mediated field resolution.
pub fn safe_format(
    interp: &Interpreter,
    template: &str,
    args: &[Value],
    named: Option<&Value>,
) -> EvalResult<String> {
    let mut fields = FieldCounter::default();
    render(interp, template, args, named, &mut fields, 0)
}

#[derive(Default)]
struct FieldCounter {
    next_auto: usize,
    auto: bool,
    manual: bool,
}

fn render(
    interp: &Interpreter,
    template: &str,
    args: &[Value],
    named: Option<&Value>,
    fields: &mut FieldCounter,
    depth: usize,
) -> EvalResult<String> {
    if depth > 1 {
        return Err(value_error("Max string recursion exceeded"));
    }
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, c)| *c) == Some('{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek().map(|(_, c)| *c) == Some('}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(value_error("Single '}' encountered in format string")),
            '{' => {
                let start = i + 1;
                let mut nesting = 1;
                let mut end = None;
                for (j, c) in chars.by_ref() {
                    match c {
                        '{' => nesting += 1,
                        '}' => {
                            nesting -= 1;
                            if nesting == 0 {
                                end = Some(j);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let Some(end) = end else {
                    return Err(value_error("Single '{' encountered in format string"));
                };
                let field = &template[start..end];
                out.push_str(&replace_field(interp, field, args, named, fields, depth)?);
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn replace_field(
    interp: &Interpreter,
    field: &str,
    args: &[Value],
    named: Option<&Value>,
    fields: &mut FieldCounter,
    depth: usize,
) -> EvalResult<String> {
    let (head, spec) = match field.find(':') {
        Some(p) => (&field[..p], &field[p + 1..]),
        None => (field, ""),
    };
    let (path, conversion) = match head.rfind('!') {
        Some(p) => (&head[..p], Some(&head[p + 1..])),
        None => (head, None),
    };

    let first_end = path.find(['.', '[']).unwrap_or(path.len());
    let (first, mut rest) = path.split_at(first_end);
    let mut value = if first.is_empty() {
        if fields.manual {
            return Err(value_error(
                "cannot switch from manual field specification to automatic field numbering",
            ));
        }
        fields.auto = true;
        let i = fields.next_auto;
        fields.next_auto += 1;
        positional(args, i)?
    } else if let Ok(i) = first.parse::<usize>() {
        if fields.auto {
            return Err(value_error(
                "cannot switch from automatic field numbering to manual field specification",
            ));
        }
        fields.manual = true;
        positional(args, i)?
    } else {
        named_value(interp, named, first)?
    };

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            let attr = &after[..end];
            if attr.is_empty() {
                return Err(value_error("Empty attribute in format string"));
            }
            value = mediator::getattr(interp, &value, attr, None)?;
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let Some(close) = after.find(']') else {
                return Err(value_error("Missing ']' in format string"));
            };
            let key = &after[..close];
            let key = match key.parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::str(key),
            };
            value = interp.get_item(&value, &key)?;
            rest = &after[close + 1..];
        } else {
            return Err(value_error(
                "Only '.' or '[' may follow ']' in format field specifier",
            ));
        }
    }

    let value = match conversion {
        None => value,
        Some("r") | Some("a") => Value::from(interp.repr(&value)?),
        Some("s") => Value::from(interp.to_str(&value)?),
        Some(other) => {
            return Err(value_error(format!(
                "Unknown conversion specifier {other}"
            )));
        }
    };
    let spec = if spec.contains('{') {
        render(interp, spec, args, named, fields, depth + 1)?
    } else {
        spec.to_string()
    };
    format_value(interp, &value, &spec)
}

fn positional(args: &[Value], i: usize) -> EvalResult<Value> {
    args.get(i).cloned().ok_or_else(|| {
        index_error(format!(
            "Replacement index {i} out of range for positional args tuple"
        ))
    })
}

fn named_value(interp: &Interpreter, named: Option<&Value>, name: &str) -> EvalResult<Value> {
    match named {
        Some(Value::Mapping(m)) => m
            .get(&MapKey::str(name))
            .ok_or_else(|| key_error(str_repr(name))),
        Some(other) => interp.get_item(other, &Value::str(name)),
        None => Err(key_error(str_repr(name))),
    }
}

/// A parsed format specification.
#[derive(Debug, Clone, PartialEq)]
struct Spec {
    fill: char,
    align: Option<char>,
    sign: char,
    alternate: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> EvalResult<Spec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    let mut out = Spec {
        fill: ' ',
        align: None,
        sign: '-',
        alternate: false,
        width: 0,
        grouping: None,
        precision: None,
        kind: None,
    };
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = chars[0];
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().is_some_and(|c| is_align(*c)) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(c @ ('+' | '-' | ' ')) = chars.get(i) {
        out.sign = *c;
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        out.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        if out.align.is_none() {
            out.fill = '0';
            out.align = Some('=');
        }
        i += 1;
    }
    let digits = |i: &mut usize| {
        let start = *i;
        while chars.get(*i).is_some_and(char::is_ascii_digit) {
            *i += 1;
        }
        chars[start..*i].iter().collect::<String>().parse::<usize>().ok()
    };
    out.width = digits(&mut i).unwrap_or(0);
    if let Some(c @ (',' | '_')) = chars.get(i) {
        out.grouping = Some(*c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        out.precision = Some(digits(&mut i).ok_or_else(|| value_error("Format specifier missing precision"))?);
    }
    if let Some(c) = chars.get(i) {
        out.kind = Some(*c);
        i += 1;
    }
    if i != chars.len() {
        return Err(value_error("Invalid format specifier"));
    }
    Ok(out)
}

/// `format(value, spec)`.
pub fn format_value(interp: &Interpreter, value: &Value, spec: &str) -> EvalResult<String> {
    if spec.is_empty() {
        return interp.to_str(value);
    }
    let spec = parse_spec(spec)?;
    let unknown = |code: char| {
        value_error(format!(
            "Unknown format code '{code}' for object of type '{}'",
            value.type_name()
        ))
    };
    let (negative, body, numeric) = match (value, spec.kind) {
        (Value::Int(_) | Value::Bool(_), None | Some('d' | 'x' | 'X' | 'o' | 'b' | 'n')) => {
            let i = value.as_int().unwrap_or(0);
            let n = i.unsigned_abs();
            let body = match spec.kind {
                Some('x') => prefixed(spec.alternate, "0x", format!("{n:x}")),
                Some('X') => prefixed(spec.alternate, "0X", format!("{n:X}")),
                Some('o') => prefixed(spec.alternate, "0o", format!("{n:o}")),
                Some('b') => prefixed(spec.alternate, "0b", format!("{n:b}")),
                _ => group(&n.to_string(), spec.grouping),
            };
            (i < 0, body, true)
        }
        (Value::Int(_) | Value::Bool(_) | Value::Float(_), Some(k @ ('f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%')))
        | (Value::Float(_), Some(k @ 'n')) => {
            let f = match value {
                Value::Float(f) => *f,
                other => other.as_int().unwrap_or(0) as f64,
            };
            (f.is_sign_negative() && f != 0.0, float_body(f.abs(), k, &spec), true)
        }
        (Value::Float(f), None) => {
            let body = match spec.precision {
                Some(p) => general(f.abs(), p.max(1), false),
                None => float_repr(f.abs()),
            };
            (f.is_sign_negative() && *f != 0.0, body, true)
        }
        (Value::Int(_) | Value::Bool(_) | Value::Float(_), Some(code)) => return Err(unknown(code)),
        (Value::Str(s), None | Some('s')) => {
            let text: String = match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.to_string(),
            };
            (false, text, false)
        }
        (Value::Str(_), Some(code)) => return Err(unknown(code)),
        (other, None | Some('s')) => {
            let text = interp.to_str(other)?;
            let text = match spec.precision {
                Some(p) => text.chars().take(p).collect(),
                None => text,
            };
            (false, text, false)
        }
        (_, Some(_)) => {
            return Err(type_error(format!(
                "unsupported format string passed to {}.__format__",
                value.type_name()
            )));
        }
    };
    if !numeric && (spec.sign != '-' || spec.align == Some('=')) {
        return Err(value_error("Sign not allowed in string format specifier"));
    }
    let sign = match (negative, spec.sign) {
        (true, _) => "-",
        (false, '+') => "+",
        (false, ' ') => " ",
        _ => "",
    };
    Ok(pad(sign, &body, &spec, numeric))
}

fn prefixed(alternate: bool, prefix: &str, digits: String) -> String {
    if alternate { format!("{prefix}{digits}") } else { digits }
}

fn group(digits: &str, sep: Option<char>) -> String {
    let Some(sep) = sep else {
        return digits.to_string();
    };
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(sep);
        }
        out.push(c);
    }
    out
}

fn float_body(f: f64, kind: char, spec: &Spec) -> String {
    if f.is_nan() {
        return if kind.is_uppercase() { "NAN" } else { "nan" }.to_string();
    }
    if f.is_infinite() {
        return if kind.is_uppercase() { "INF" } else { "inf" }.to_string();
    }
    let precision = spec.precision.unwrap_or(6);
    match kind {
        'f' | 'F' => grouped_fixed(&format!("{f:.precision$}"), spec.grouping),
        '%' => format!("{}%", grouped_fixed(&format!("{:.precision$}", f * 100.0), spec.grouping)),
        'e' | 'E' => {
            let s = scientific(f, precision);
            if kind == 'E' { s.to_uppercase() } else { s }
        }
        _ => {
            let s = general(f, precision.max(1), spec.alternate);
            if kind == 'G' { s.to_uppercase() } else { s }
        }
    }
}

fn grouped_fixed(text: &str, sep: Option<char>) -> String {
    match text.split_once('.') {
        Some((int, frac)) => format!("{}.{frac}", group(int, sep)),
        None => group(text, sep),
    }
}

/// `1.5e+03` style, as the `e` presentation type renders it.
fn scientific(f: f64, precision: usize) -> String {
    let s = format!("{f:.precision$e}");
    let Some((mantissa, exp)) = s.split_once('e') else {
        return s;
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exp.abs())
}

/// The `g` presentation type: `precision` significant digits, switching to
/// scientific notation for very large or small magnitudes.
fn general(f: f64, precision: usize, keep_zeros: bool) -> String {
    if f == 0.0 {
        return "0".to_string();
    }
    let exp = f.abs().log10().floor() as i32;
    let s = if exp < -4 || exp >= precision as i32 {
        scientific(f, precision - 1)
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        format!("{f:.decimals$}")
    };
    if keep_zeros {
        return s;
    }
    match s.split_once('e') {
        Some((mantissa, exp)) => format!("{}e{exp}", trim_zeros(mantissa)),
        None => trim_zeros(&s),
    }
}

fn trim_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

fn pad(sign: &str, body: &str, spec: &Spec, numeric: bool) -> String {
    let len = sign.chars().count() + body.chars().count();
    if len >= spec.width {
        return format!("{sign}{body}");
    }
    let n = spec.width - len;
    let fill = |k: usize| std::iter::repeat_n(spec.fill, k).collect::<String>();
    let align = spec.align.unwrap_or(if numeric { '>' } else { '<' });
    match align {
        '<' => format!("{sign}{body}{}", fill(n)),
        '^' => format!("{}{sign}{body}{}", fill(n / 2), fill(n - n / 2)),
        '=' => format!("{sign}{}{body}", fill(n)),
        _ => format!("{}{sign}{body}", fill(n)),
    }
}

/// `fmt % args`.
pub fn percent_format(interp: &Interpreter, fmt: &str, args: &Value) -> EvalResult<String> {
    let (items, mapping) = match args {
        Value::Tuple(t) => (t.to_vec(), None),
        Value::Mapping(_) => (Vec::new(), Some(args)),
        other => (vec![other.clone()], None),
    };
    let mut next = items.iter();
    let mut out = String::with_capacity(fmt.len());
    let chars: Vec<char> = fmt.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut key = None;
        if chars.get(i) == Some(&'(') {
            let Some(close) = chars[i..].iter().position(|c| *c == ')') else {
                return Err(value_error("incomplete format key"));
            };
            key = Some(chars[i + 1..i + close].iter().collect::<String>());
            i += close + 1;
        }
        let mut flags = String::new();
        while let Some(c @ ('-' | '+' | ' ' | '0' | '#')) = chars.get(i) {
            flags.push(*c);
            i += 1;
        }
        let mut width = String::new();
        while let Some(c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
            width.push(*c);
            i += 1;
        }
        let mut precision = None;
        if chars.get(i) == Some(&'.') {
            i += 1;
            let mut p = String::new();
            while let Some(c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
                p.push(*c);
                i += 1;
            }
            precision = Some(if p.is_empty() { "0".to_string() } else { p });
        }
        let Some(&kind) = chars.get(i) else {
            return Err(value_error("incomplete format"));
        };
        i += 1;
        if kind == '%' {
            out.push('%');
            continue;
        }
        let value = match &key {
            Some(k) => match mapping {
                Some(m) => interp.get_item(m, &Value::str(k))?,
                None => return Err(type_error("format requires a mapping")),
            },
            None => next
                .next()
                .cloned()
                .ok_or_else(|| type_error("not enough arguments for format string"))?,
        };
        let (value, code) = match kind {
            's' => (Value::from(interp.to_str(&value)?), 's'),
            'r' | 'a' => (Value::from(interp.repr(&value)?), 's'),
            'd' | 'i' | 'u' => match value {
                Value::Float(f) if f.is_finite() => (Value::Int(f.trunc() as i64), 'd'),
                Value::Int(_) | Value::Bool(_) => (value, 'd'),
                other => {
                    return Err(type_error(format!(
                        "%{kind} format: a real number is required, not {}",
                        other.type_name()
                    )));
                }
            },
            'c' => match value {
                Value::Int(i) => (
                    Value::from(
                        u32::try_from(i)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| value_error("%c arg not in range"))?
                            .to_string(),
                    ),
                    's',
                ),
                Value::Str(_) => (value, 's'),
                _ => return Err(type_error("%c requires int or char")),
            },
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o' => (value, kind),
            other => {
                return Err(value_error(format!(
                    "unsupported format character '{other}'"
                )));
            }
        };
        let mut spec = String::from(if flags.contains('-') { "<" } else { ">" });
        if code != 's' {
            if flags.contains('+') {
                spec.push('+');
            } else if flags.contains(' ') {
                spec.push(' ');
            }
            if flags.contains('#') {
                spec.push('#');
            }
            if flags.contains('0') && !flags.contains('-') {
                spec = spec.replacen('>', "0=", 1);
            }
        }
        spec.push_str(&width);
        if let Some(p) = &precision {
            spec.push('.');
            spec.push_str(p);
        }
        spec.push(code);
        out.push_str(&format_value(interp, &value, &spec)?);
    }
    if mapping.is_none() && next.next().is_some() {
        return Err(type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::testing::interpreter;
    use std::rc::Rc;

    fn fmt(template: &str, args: &[Value]) -> String {
        let (interp, _) = interpreter();
        safe_format(&interp, template, args, None).unwrap()
    }

    fn spec(value: Value, spec: &str) -> String {
        let (interp, _) = interpreter();
        format_value(&interp, &value, spec).unwrap()
    }

    #[test]
    fn test_fields_and_escapes() {
        assert_eq!(fmt("{} + {} = {}", &[1.into(), 2.into(), 3.into()]), "1 + 2 = 3");
        assert_eq!(fmt("{1}{0}{{}}", &["a".into(), "b".into()]), "ba{}");
        assert_eq!(fmt("{0!r:>6}", &["x".into()]), "   'x'");
        let list = Value::list(vec![Value::str("p"), Value::str("q")]);
        assert_eq!(fmt("{0[1]}", &[list]), "q");
    }

    #[test]
    fn test_mixing_auto_and_manual_numbering_fails() {
        let (interp, _) = interpreter();
        let err = safe_format(&interp, "{}{0}", &[1.into()], None).unwrap_err();
        assert!(err.to_string().contains("cannot switch"));
    }

    #[test]
    fn test_named_fields_come_from_the_mapping() {
        let (interp, _) = interpreter();
        let m = Value::Mapping(Rc::new(crate::kernel::store::LockedMapping::from_pairs([(
            MapKey::str("who"),
            Value::str("you"),
        )])));
        assert_eq!(safe_format(&interp, "hi {who}", &[], Some(&m)).unwrap(), "hi you");
        let err = safe_format(&interp, "{nobody}", &[], Some(&m)).unwrap_err();
        assert_eq!(err.type_name(), "KeyError");
    }

    #[test]
    fn test_attribute_steps_are_mediated() {
        let (interp, _) = interpreter();
        let err = safe_format(&interp, "{0.__class__.__class__}", &[Value::Int(1)], None).unwrap_err();
        assert_eq!(err.type_name(), "ForbiddenAccessError");
    }

    #[test]
    fn test_format_specs() {
        assert_eq!(spec(Value::Int(42), "05d"), "00042");
        assert_eq!(spec(Value::Int(42), "+6"), "   +42");
        assert_eq!(spec(Value::Int(-42), "*>6"), "***-42");
        assert_eq!(spec(Value::Int(1234567), ","), "1,234,567");
        assert_eq!(spec(Value::Int(255), "#x"), "0xff");
        assert_eq!(spec(Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(spec(Value::Float(0.25), ".1%"), "25.0%");
        assert_eq!(spec(Value::Float(1500.0), ".2e"), "1.50e+03");
        assert_eq!(spec(Value::str("ab"), "*^6"), "**ab**");
        assert_eq!(spec(Value::str("abcdef"), ".3"), "abc");
    }

    #[test]
    fn test_percent_format() {
        let (interp, _) = interpreter();
        let args = Value::tuple(vec![Value::str("x"), Value::Int(7), Value::Float(2.5)]);
        assert_eq!(
            percent_format(&interp, "%s=%03d (%.1f) 100%%", &args).unwrap(),
            "x=007 (2.5) 100%"
        );
        let err = percent_format(&interp, "%s %s", &Value::str("one")).unwrap_err();
        assert!(err.to_string().contains("not enough arguments"));
        let err = percent_format(&interp, "%s", &Value::tuple(vec![1.into(), 2.into()])).unwrap_err();
        assert!(err.to_string().contains("not all arguments converted"));
    }
}
