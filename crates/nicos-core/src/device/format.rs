// ── Value formatting ──
//
// The subset of printf formatting used in `fmtstr` parameters:
// `%[flags][width][.prec]` with `f F d i s r g G e E` and `%%`. A tuple
// value spreads over several conversions.

use nicos_proto::Value;

#[derive(Debug, Default, Clone, Copy)]
struct Spec {
    left: bool,
    plus: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
    conv: char,
}

enum Piece<'a> {
    Text(&'a str),
    Percent,
    Conv(Spec),
}

/// Format `value` according to `fmtstr`.
///
/// Values that don't fit the conversion (e.g. a string for `%f`) are
/// rendered as literals instead of failing.
pub fn format_value(fmtstr: &str, value: &Value) -> String {
    let pieces = parse(fmtstr);
    let conversions = pieces
        .iter()
        .filter(|p| matches!(p, Piece::Conv(_)))
        .count();
    let args: Vec<&Value> = match value {
        Value::Tuple(items) | Value::List(items) if conversions > 1 && items.len() == conversions => {
            items.iter().collect()
        }
        other => vec![other],
    };

    let mut out = String::new();
    let mut args = args.into_iter();
    for piece in pieces {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Percent => out.push('%'),
            Piece::Conv(spec) => match args.next() {
                Some(arg) => out.push_str(&convert(spec, arg)),
                None => out.push_str("%?"),
            },
        }
    }
    out
}

fn parse(fmtstr: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut rest = fmtstr;
    while let Some(pos) = rest.find('%') {
        if pos > 0 {
            pieces.push(Piece::Text(&rest[..pos]));
        }
        let spec_src = &rest[pos + 1..];
        if let Some(after) = spec_src.strip_prefix('%') {
            pieces.push(Piece::Percent);
            rest = after;
            continue;
        }
        match parse_spec(spec_src) {
            Some((spec, used)) => {
                pieces.push(Piece::Conv(spec));
                rest = &spec_src[used..];
            }
            None => {
                pieces.push(Piece::Text("%"));
                rest = spec_src;
            }
        }
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    pieces
}

fn parse_spec(src: &str) -> Option<(Spec, usize)> {
    let mut spec = Spec::default();
    let mut chars = src.char_indices().peekable();

    while let Some(&(_, c)) = chars.peek() {
        match c {
            '-' => spec.left = true,
            '+' => spec.plus = true,
            '0' => spec.zero = true,
            ' ' | '#' => {}
            _ => break,
        }
        chars.next();
    }
    let mut width = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        width.push(c);
        chars.next();
    }
    spec.width = width.parse().unwrap_or(0);
    if let Some(&(_, '.')) = chars.peek() {
        chars.next();
        let mut prec = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            prec.push(c);
            chars.next();
        }
        spec.precision = Some(prec.parse().unwrap_or(0));
    }
    let (idx, conv) = chars.next()?;
    if !"fFdisrgGeE".contains(conv) {
        return None;
    }
    spec.conv = conv;
    Some((spec, idx + conv.len_utf8()))
}

fn convert(spec: Spec, value: &Value) -> String {
    let numeric = value.as_f64().or_else(|| value.as_bool().map(f64::from));
    let body = match (spec.conv, numeric) {
        ('f' | 'F', Some(v)) => with_sign(spec, v, format!("{:.*}", spec.precision.unwrap_or(6), v.abs())),
        ('d' | 'i', Some(v)) => with_sign(spec, v, format!("{:.0}", v.abs().trunc())),
        ('e' | 'E', Some(v)) => {
            let s = exponential(v.abs(), spec.precision.unwrap_or(6));
            with_sign(spec, v, if spec.conv == 'E' { s.to_uppercase() } else { s })
        }
        ('g' | 'G', Some(v)) => {
            let s = general(v.abs(), spec.precision.unwrap_or(6));
            with_sign(spec, v, if spec.conv == 'G' { s.to_uppercase() } else { s })
        }
        ('r', _) => value.encode(),
        (_, _) => match value {
            Value::Str(s) => s.clone(),
            other => other.encode(),
        },
    };
    pad(spec, body, numeric.is_some())
}

fn with_sign(spec: Spec, v: f64, digits: String) -> String {
    if v.is_sign_negative() && v != 0.0 {
        format!("-{digits}")
    } else if spec.plus {
        format!("+{digits}")
    } else {
        digits
    }
}

fn pad(spec: Spec, body: String, numeric: bool) -> String {
    let len = body.chars().count();
    if len >= spec.width {
        return body;
    }
    let fill = spec.width - len;
    if spec.left {
        format!("{body}{}", " ".repeat(fill))
    } else if spec.zero && numeric {
        let (sign, digits) = match body.chars().next() {
            Some(c @ ('-' | '+')) => (c.to_string(), &body[1..]),
            _ => (String::new(), body.as_str()),
        };
        format!("{sign}{}{digits}", "0".repeat(fill))
    } else {
        format!("{}{body}", " ".repeat(fill))
    }
}

/// `d.dddde+XX`
fn exponential(v: f64, precision: usize) -> String {
    if !v.is_finite() {
        return non_finite(v);
    }
    let formatted = format!("{v:.precision$e}");
    let (mantissa, exp) = formatted.split_once('e').unwrap_or((&formatted, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exp.abs())
}

/// Shortest of fixed and exponential, trailing zeros removed.
fn general(v: f64, precision: usize) -> String {
    if !v.is_finite() {
        return non_finite(v);
    }
    let precision = precision.max(1);
    if v == 0.0 {
        return "0".into();
    }
    let exp_form = exponential(v, precision - 1);
    let exp: i32 = exp_form
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    let max_exp = i32::try_from(precision).unwrap_or(i32::MAX);
    if exp < -4 || exp >= max_exp {
        let (mantissa, e) = exp_form.split_once('e').unwrap_or((&exp_form, ""));
        format!("{}e{e}", strip_zeros(mantissa))
    } else {
        let decimals = usize::try_from(max_exp - 1 - exp).unwrap_or(0);
        strip_zeros(&format!("{v:.decimals$}")).to_owned()
    }
}

fn strip_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn non_finite(v: f64) -> String {
    if v.is_nan() { "nan".into() } else { "inf".into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format() {
        assert_eq!(format_value("%.3f", &Value::Float(1.23456)), "1.235");
        assert_eq!(format_value("%.3f", &Value::Int(-2)), "-2.000");
        assert_eq!(format_value("%.3f", &Value::from("open")), "open");
    }

    #[test]
    fn width_and_flags() {
        assert_eq!(format_value("%6.2f K", &Value::Float(3.14159)), "  3.14 K");
        assert_eq!(format_value("%-5d|", &Value::Int(42)), "42   |");
        assert_eq!(format_value("%05d", &Value::Int(-42)), "-0042");
        assert_eq!(format_value("%+.1f", &Value::Float(2.0)), "+2.0");
        assert_eq!(format_value("100%%", &Value::None), "100%");
    }

    #[test]
    fn exponential_and_general() {
        assert_eq!(format_value("%.2e", &Value::Float(12345.0)), "1.23e+04");
        assert_eq!(format_value("%g", &Value::Float(0.0001)), "0.0001");
        assert_eq!(format_value("%g", &Value::Float(1_234_567.0)), "1.23457e+06");
        assert_eq!(format_value("%g", &Value::Float(2.5)), "2.5");
    }

    #[test]
    fn tuples_spread_over_conversions() {
        let value = Value::Tuple(vec![Value::Float(1.0), Value::Float(2.5)]);
        assert_eq!(format_value("%.1f, %.1f", &value), "1.0, 2.5");
        assert_eq!(format_value("%s", &value), "(1.0, 2.5)");
    }
}
