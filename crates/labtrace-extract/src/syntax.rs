//! Tree-sitter node helpers for Python procedure sources.
//!
//! Child lookup, text and position extraction, and constant folding of
//! literal expressions. Shared by the static extractor and the tracer.

use labtrace_core::{Literal, SourcePosition};
use tree_sitter::Node;

// ═══════════════════════════════════════════════════════════════════════════
// Node traversal
// ═══════════════════════════════════════════════════════════════════════════

/// Named children in source order.
pub fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    (0..node.named_child_count()).filter_map(|i| node.named_child(i)).collect()
}

/// All children (named or not) carrying field `field`.
pub fn field_children<'t>(node: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

/// First direct child of the given kind.
pub fn child_by_kind<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    (0..node.child_count()).filter_map(|i| node.child(i)).find(|c| c.kind() == kind)
}

/// First node (depth-first) that is an error or a missing token.
pub fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if !node.has_error() {
        return None;
    }
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if current.is_error() || current.is_missing() {
            return Some(current);
        }
        for i in (0..current.child_count()).rev() {
            if let Some(child) = current.child(i) {
                if child.has_error() || child.is_missing() {
                    stack.push(child);
                }
            }
        }
    }
    Some(node)
}

/// Strip redundant parentheses.
pub fn unparenthesize(mut node: Node<'_>) -> Node<'_> {
    while node.kind() == "parenthesized_expression" {
        match node.named_child(0) {
            Some(inner) => node = inner,
            None => break,
        }
    }
    node
}

// ═══════════════════════════════════════════════════════════════════════════
// Text and positions
// ═══════════════════════════════════════════════════════════════════════════

/// Source text of a node.
#[inline]
pub fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    source.get(node.start_byte()..node.end_byte()).unwrap_or("")
}

/// 1-based start position.
#[inline]
pub fn position(node: Node<'_>) -> SourcePosition {
    let p = node.start_position();
    SourcePosition::new(p.row as u32 + 1, p.column as u32 + 1)
}

/// Contents of a plain string literal; `None` for f-strings with
/// substitutions and for non-string nodes.
pub fn string_value(node: Node<'_>, source: &str) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let raw = text(node, source);
    let prefix_len = raw.find(&['"', '\''][..]).unwrap_or(0);
    let prefix = raw[..prefix_len].to_ascii_lowercase();
    let body = &raw[prefix_len..];
    if prefix.contains('f') && body.contains('{') {
        return None;
    }
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if body.len() >= 2 * quote.len() && body.starts_with(quote) && body.ends_with(quote) {
            return Some(body[quote.len()..body.len() - quote.len()].to_string());
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
// Literals and constant folding
// ═══════════════════════════════════════════════════════════════════════════

fn parse_int(text: &str) -> Option<i64> {
    let clean: String = text.chars().filter(|c| *c != '_').collect();
    let lower = clean.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = lower.strip_prefix("0b") {
        return i64::from_str_radix(bin, 2).ok();
    }
    if let Some(oct) = lower.strip_prefix("0o") {
        return i64::from_str_radix(oct, 8).ok();
    }
    lower.parse().ok()
}

/// The literal value of an expression built only from constants.
pub fn literal(node: Node<'_>, source: &str) -> Option<Literal> {
    let node = unparenthesize(node);
    match node.kind() {
        "integer" => parse_int(text(node, source)).map(Literal::Int),
        "float" => {
            let clean: String = text(node, source).chars().filter(|c| *c != '_').collect();
            clean.parse().ok().map(Literal::Float)
        }
        "string" => string_value(node, source).map(Literal::Str),
        "concatenated_string" => {
            let mut out = String::new();
            for part in named_children(node) {
                out.push_str(&string_value(part, source)?);
            }
            Some(Literal::Str(out))
        }
        "true" => Some(Literal::Bool(true)),
        "false" => Some(Literal::Bool(false)),
        "none" => Some(Literal::None),
        "list" | "tuple" => named_children(node)
            .into_iter()
            .map(|c| literal(c, source))
            .collect::<Option<Vec<_>>>()
            .map(Literal::List),
        "unary_operator" => {
            let operand = literal(node.child_by_field_name("argument")?, source)?;
            let op = node.child_by_field_name("operator").map(|o| text(o, source)).unwrap_or("");
            match (op, operand) {
                ("-", Literal::Int(i)) => Some(Literal::Int(-i)),
                ("-", Literal::Float(x)) => Some(Literal::Float(-x)),
                ("+", v @ (Literal::Int(_) | Literal::Float(_))) => Some(v),
                _ => None,
            }
        }
        "binary_operator" => {
            let left = literal(node.child_by_field_name("left")?, source)?;
            let right = literal(node.child_by_field_name("right")?, source)?;
            let op = text(node.child_by_field_name("operator")?, source);
            fold_binary(op, &left, &right)
        }
        _ => None,
    }
}

/// Fold `left op right` for numeric arithmetic and list repetition.
pub fn fold_binary(op: &str, left: &Literal, right: &Literal) -> Option<Literal> {
    match (left, right) {
        (Literal::Int(a), Literal::Int(b)) => match op {
            "+" => a.checked_add(*b).map(Literal::Int),
            "-" => a.checked_sub(*b).map(Literal::Int),
            "*" => a.checked_mul(*b).map(Literal::Int),
            "//" if *b != 0 => Some(Literal::Int((*a as f64 / *b as f64).floor() as i64)),
            "/" if *b != 0 => Some(Literal::Float(*a as f64 / *b as f64)),
            _ => None,
        },
        (Literal::List(items), Literal::Int(n)) | (Literal::Int(n), Literal::List(items))
            if op == "*" =>
        {
            let n = usize::try_from(*n).ok()?;
            if n.saturating_mul(items.len()) > 4096 {
                return None;
            }
            Some(Literal::List(items.iter().cloned().cycle().take(items.len() * n).collect()))
        }
        (Literal::List(a), Literal::List(b)) if op == "+" => {
            Some(Literal::List(a.iter().chain(b).cloned().collect()))
        }
        (Literal::Str(a), Literal::Str(b)) if op == "+" => Some(Literal::Str(format!("{a}{b}"))),
        _ => {
            let a = left.as_f64()?;
            let b = right.as_f64()?;
            let v = match op {
                "+" => a + b,
                "-" => a - b,
                "*" => a * b,
                "/" if b != 0.0 => a / b,
                _ => return None,
            };
            Some(Literal::Float(v))
        }
    }
}

/// Fold a comparison between two literals.
pub fn fold_compare(op: &str, left: &Literal, right: &Literal) -> Option<bool> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return match op {
            "<" => Some(a < b),
            "<=" => Some(a <= b),
            ">" => Some(a > b),
            ">=" => Some(a >= b),
            "==" => Some(a == b),
            "!=" => Some(a != b),
            _ => None,
        };
    }
    match op {
        "==" | "is" => Some(left == right),
        "!=" | "is not" => Some(left != right),
        "in" | "not in" => {
            let contained = match right {
                Literal::List(items) => items.contains(left),
                Literal::Str(hay) => match left {
                    Literal::Str(needle) => hay.contains(needle.as_str()),
                    _ => return None,
                },
                _ => return None,
            };
            Some(if op == "in" { contained } else { !contained })
        }
        _ => None,
    }
}

/// Operator tokens of a `comparison_operator` node, in order.
pub fn comparison_operators(node: Node<'_>, source: &str) -> Vec<String> {
    field_children(node, "operators")
        .into_iter()
        .map(|op| text(op, source).split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tree_sitter::Parser;

    fn with_expr<T>(src: &str, f: impl FnOnce(Node<'_>, &str) -> T) -> T {
        let mut parser = Parser::new();
        parser.set_language(&tree_sitter_python::language()).unwrap();
        let tree = parser.parse(src, None).unwrap();
        let stmt = tree.root_node().named_child(0).unwrap();
        let expr = stmt.named_child(0).unwrap();
        f(expr, src)
    }

    #[test]
    fn folds_numbers_and_lists() {
        assert_eq!(with_expr("50", literal), Some(Literal::Int(50)));
        assert_eq!(with_expr("-2.5", literal), Some(Literal::Float(-2.5)));
        assert_eq!(with_expr("10 * 3", literal), Some(Literal::Int(30)));
        assert_eq!(
            with_expr("[50] * 3", literal),
            Some(Literal::List(vec![Literal::Int(50); 3]))
        );
        assert_eq!(with_expr("(1_000)", literal), Some(Literal::Int(1000)));
        assert_eq!(with_expr("x + 1", literal), None);
    }

    #[test]
    fn strings() {
        assert_eq!(with_expr("\"A1:H1\"", literal), Some(Literal::Str("A1:H1".into())));
        assert_eq!(with_expr("r'A1'", literal), Some(Literal::Str("A1".into())));
        assert_eq!(with_expr("f\"{row}1\"", literal), None);
    }

    #[test]
    fn comparisons() {
        assert_eq!(fold_compare("<", &Literal::Int(1), &Literal::Float(2.0)), Some(true));
        assert_eq!(
            fold_compare("in", &Literal::Int(1), &Literal::List(vec![Literal::Int(1)])),
            Some(true)
        );
        assert_eq!(fold_compare("<", &Literal::Str("a".into()), &Literal::Int(1)), None);
    }

    #[test]
    fn positions_are_one_based() {
        let mut parser = Parser::new();
        parser.set_language(&tree_sitter_python::language()).unwrap();
        let tree = parser.parse("x = 1\ny = 2\n", None).unwrap();
        let second = tree.root_node().named_child(1).unwrap();
        assert_eq!(position(second), SourcePosition::new(2, 1));
    }
}
