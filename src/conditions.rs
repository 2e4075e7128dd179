use regex::Regex;
use serde_json::Value;

use crate::models::ConditionOutcome;
use crate::probes::ProbeContext;

/// A single monitor condition, parsed once at config load and evaluated by
/// walking the resulting expression. Parsing is infallible: anything that
/// does not fit the grammar becomes an expression that evaluates to false.
#[derive(Debug, Clone)]
pub struct Condition {
    text: String,
    expr: Expr,
}

#[derive(Debug, Clone)]
enum Expr {
    Compare { lhs: Operand, op: Op, rhs: Operand },
    Bare(Operand),
}

#[derive(Debug, Clone)]
enum Operand {
    /// `[KEY]` with an optional trailing path (paths apply to `[BODY]` only).
    Placeholder { key: String, path: Option<String> },
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Contains,
    Matches,
}

/// Operator tokens in match priority order. `>=`/`<=` precede `>`/`<` so the
/// longer token wins.
const OPERATORS: [(&str, Op, bool); 8] = [
    ("==", Op::Eq, false),
    ("!=", Op::Ne, false),
    (">=", Op::Ge, false),
    ("<=", Op::Le, false),
    (">", Op::Gt, false),
    ("<", Op::Lt, false),
    ("contains", Op::Contains, true),
    ("matches", Op::Matches, true),
];

impl Condition {
    pub fn parse(text: &str) -> Condition {
        let trimmed = text.trim();
        let expr = match find_operator(trimmed) {
            Some((start, end, op)) => Expr::Compare {
                lhs: parse_operand(&trimmed[..start]),
                op,
                rhs: parse_operand(&trimmed[end..]),
            },
            None => Expr::Bare(parse_operand(trimmed)),
        };
        Condition { text: text.to_string(), expr }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate against a probe context. Total: any fault yields false.
    pub fn evaluate(&self, ctx: &ProbeContext) -> bool {
        match &self.expr {
            Expr::Compare { lhs, op, rhs } => {
                let (Some(l), Some(r)) = (resolve(lhs, ctx), resolve(rhs, ctx)) else {
                    // Null/missing on either side fails every comparison.
                    return false;
                };
                apply(*op, &l, &r)
            }
            Expr::Bare(operand) => matches!(resolve(operand, ctx), Some(Value::Bool(true))),
        }
    }
}

/// Compile a monitor's condition strings.
pub fn compile_all(conditions: &[String]) -> Vec<Condition> {
    conditions.iter().map(|c| Condition::parse(c)).collect()
}

/// Evaluate every condition in order, preserving the configured order.
pub fn evaluate_all(conditions: &[Condition], ctx: &ProbeContext) -> Vec<ConditionOutcome> {
    conditions
        .iter()
        .map(|c| ConditionOutcome { condition: c.text().to_string(), passed: c.evaluate(ctx) })
        .collect()
}

// ─── Parsing ────────────────────────────────────────────────────────────────

/// Find the operator to split on: tokens are tried in priority order, and an
/// occurrence only counts outside string literals and outside `[...]`, so a
/// quoted `"=="` or a bracketed path index never splits the expression.
fn find_operator(text: &str) -> Option<(usize, usize, Op)> {
    for (token, op, word) in OPERATORS {
        if let Some(start) = find_token(text, token, word) {
            return Some((start, start + token.len(), op));
        }
    }
    None
}

fn find_token(text: &str, token: &str, word: bool) -> Option<usize> {
    // Byte-wise scan. Operator tokens are pure ASCII, so a match position is
    // always a char boundary even in multibyte input.
    let bytes = text.as_bytes();
    let tok = token.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b'[' if !in_single && !in_double => depth += 1,
            b']' if !in_single && !in_double => depth = depth.saturating_sub(1),
            _ => {}
        }
        if !in_single && !in_double && depth == 0 && bytes[i..].starts_with(tok) {
            let boundary_ok = if word {
                let before_ok = i == 0 || bytes[i - 1].is_ascii_whitespace();
                let after = i + tok.len();
                let after_ok = after >= bytes.len() || bytes[after].is_ascii_whitespace();
                before_ok && after_ok
            } else {
                true
            };
            // A leading operator would leave an empty left side; skip it.
            if boundary_ok && i > 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn parse_operand(s: &str) -> Operand {
    let t = s.trim();
    if let Some(rest) = t.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let key = &rest[..close];
            let is_key = !key.is_empty()
                && key.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
            if is_key {
                let path = rest[close + 1..].trim();
                return Operand::Placeholder {
                    key: key.to_string(),
                    path: if path.is_empty() { None } else { Some(path.to_string()) },
                };
            }
        }
    }
    Operand::Literal(parse_literal(t))
}

fn parse_literal(t: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(t) {
        return v;
    }
    // Single-quoted strings and bare words are accepted as strings.
    if t.len() >= 2 && t.starts_with('\'') && t.ends_with('\'') {
        return Value::String(t[1..t.len() - 1].to_string());
    }
    Value::String(t.to_string())
}

// ─── Evaluation ─────────────────────────────────────────────────────────────

/// Resolve an operand to a value; `None` is the null/undefined state.
fn resolve(operand: &Operand, ctx: &ProbeContext) -> Option<Value> {
    match operand {
        Operand::Placeholder { key, path } => {
            let base = ctx.get(key)?;
            if base.is_null() {
                return None;
            }
            match path {
                None => Some(base.clone()),
                Some(p) if key == "BODY" => {
                    let v = resolve_path(base, p)?;
                    if v.is_null() { None } else { Some(v) }
                }
                Some(_) => None,
            }
        }
        Operand::Literal(v) => {
            if v.is_null() { None } else { Some(v.clone()) }
        }
    }
}

/// Walk a dotted/bracketed path (`.status`, `.v[0]`, `.a["b"].c`) against a
/// JSON value, returning the first match.
fn resolve_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    let mut rest = path;
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix('.') {
            let end = r.find(['.', '[']).unwrap_or(r.len());
            let (field, tail) = r.split_at(end);
            if field.is_empty() {
                return None;
            }
            current = current.get(field)?;
            rest = tail;
        } else if let Some(r) = rest.strip_prefix('[') {
            let close = r.find(']')?;
            let token = r[..close].trim();
            if let Ok(idx) = token.parse::<usize>() {
                current = current.get(idx)?;
            } else {
                let key = token.trim_matches(|c| c == '"' || c == '\'');
                current = current.get(key)?;
            }
            rest = &r[close + 1..];
        } else {
            return None;
        }
    }
    Some(current.clone())
}

fn apply(op: Op, l: &Value, r: &Value) -> bool {
    match op {
        Op::Eq => loose_eq(l, r),
        Op::Ne => !loose_eq(l, r),
        Op::Gt | Op::Ge | Op::Lt | Op::Le => ordered(op, l, r),
        Op::Contains => stringify(l).contains(&stringify(r)),
        Op::Matches => Regex::new(&stringify(r))
            .map(|re| re.is_match(&stringify(l)))
            .unwrap_or(false),
    }
}

/// Loose equality: strings compare as strings, numbers as numbers, and a
/// number-shaped string coerces to its numeric value.
fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => match (coerce_number(l), coerce_number(r)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// Ordering: numeric on numbers, lexicographic on strings, false on mixed.
fn ordered(op: Op, l: &Value, r: &Value) -> bool {
    let cmp = match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            }
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(cmp) = cmp else { return false };
    match op {
        Op::Gt => cmp == std::cmp::Ordering::Greater,
        Op::Ge => cmp != std::cmp::Ordering::Less,
        Op::Lt => cmp == std::cmp::Ordering::Less,
        Op::Le => cmp != std::cmp::Ordering::Greater,
        _ => false,
    }
}

fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ProbeContext {
        let mut ctx = ProbeContext::new();
        ctx.insert("STATUS".into(), json!(200));
        ctx.insert("RESPONSE_TIME".into(), json!(120));
        ctx.insert("CONNECTED".into(), json!(true));
        ctx.insert("BODY".into(), json!({"status": "healthy", "v": [1, 2, 3]}));
        ctx
    }

    fn eval(text: &str, ctx: &ProbeContext) -> bool {
        Condition::parse(text).evaluate(ctx)
    }

    #[test]
    fn status_and_response_time_comparisons() {
        let ctx = ctx();
        assert!(eval("[STATUS] == 200", &ctx));
        assert!(eval("[STATUS] != 500", &ctx));
        assert!(eval("[RESPONSE_TIME] < 500", &ctx));
        assert!(eval("[RESPONSE_TIME] >= 120", &ctx));
        assert!(!eval("[RESPONSE_TIME] > 120", &ctx));
        assert!(!eval("[STATUS] == 404", &ctx));
    }

    #[test]
    fn body_path_extraction() {
        let ctx = ctx();
        assert!(eval("[BODY].status == 'healthy'", &ctx));
        assert!(eval("[BODY].v[0] == 1", &ctx));
        assert!(eval("[BODY].v[2] >= 3", &ctx));
        assert!(!eval("[BODY].missing == 1", &ctx));
        assert!(!eval("[BODY].v[9] == 1", &ctx));
    }

    #[test]
    fn string_coercion_for_equality() {
        let mut ctx = ProbeContext::new();
        ctx.insert("STATUS".into(), json!("200"));
        assert!(eval("[STATUS] == 200", &ctx));
    }

    #[test]
    fn contains_and_matches() {
        let mut ctx = ProbeContext::new();
        ctx.insert("BODY".into(), json!("service is healthy"));
        assert!(eval("[BODY] contains 'healthy'", &ctx));
        assert!(!eval("[BODY] contains 'degraded'", &ctx));
        assert!(eval("[BODY] matches 'is\\s+healthy'", &ctx));
        // An invalid regex fails the condition, never panics.
        assert!(!eval("[BODY] matches '('", &ctx));
    }

    #[test]
    fn bare_boolean_expressions() {
        let ctx = ctx();
        assert!(eval("[CONNECTED]", &ctx));
        assert!(eval("true", &ctx));
        assert!(!eval("false", &ctx));
        assert!(!eval("1", &ctx));
    }

    #[test]
    fn missing_keys_fail_every_comparison() {
        let ctx = ProbeContext::new();
        assert!(!eval("[STATUS] == 200", &ctx));
        assert!(!eval("[STATUS] != 200", &ctx));
        assert!(!eval("[STATUS] < 200", &ctx));
        assert!(!eval("[CERTIFICATE_EXPIRY_DAYS] > 7", &ctx));
    }

    #[test]
    fn operators_inside_strings_do_not_split() {
        let mut ctx = ProbeContext::new();
        ctx.insert("BODY".into(), json!("a == b"));
        assert!(eval("[BODY] contains 'a == b'", &ctx));
    }

    #[test]
    fn mixed_type_ordering_is_false() {
        let mut ctx = ProbeContext::new();
        ctx.insert("STATUS".into(), json!("abc"));
        assert!(!eval("[STATUS] < 500", &ctx));
        assert!(!eval("[STATUS] > 500", &ctx));
    }

    #[test]
    fn garbage_never_raises() {
        let ctx = ctx();
        for junk in [
            "",
            "   ",
            "== ==",
            "[",
            "]",
            "[BODY",
            "[BODY].. == 1",
            "[STATUS] ==",
            ">= 3",
            "contains",
            "[BODY].v[x] == 1",
            "{\"a\": } == 1",
            "[STATUS] <> 200",
            "статус == 200",
            "[BODY] contains 'héllo == wörld'",
        ] {
            // Must return a boolean without panicking; value itself may vary.
            let _ = eval(junk, &ctx);
        }
    }

    #[test]
    fn evaluate_all_preserves_order() {
        let ctx = ctx();
        let conditions = compile_all(&[
            "[STATUS] == 200".to_string(),
            "[RESPONSE_TIME] < 500".to_string(),
            "[BODY].status == 'healthy'".to_string(),
            "[BODY].v[0] == 1".to_string(),
        ]);
        let outcomes = evaluate_all(&conditions, &ctx);
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o.passed));
        assert_eq!(outcomes[2].condition, "[BODY].status == 'healthy'");
    }
}
