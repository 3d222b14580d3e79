//! Declared-type inspection for procedure parameters.
//!
//! Parses annotation text (`list[Well]`, `Plate | TipRack`,
//! `Optional["TipRack"]`, `tuple[Plate, list[Well]]`) into a [`TypeExpr`]
//! and reduces it to a [`DeclaredType`]: the resource kinds referenced, in
//! declared order, plus container information. Inspection is total:
//! anything unrecognized yields an empty kind set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::kind::{ResourceKind, Shape};

/// Parsed annotation expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExpr {
    /// A plain or dotted name: `Plate`, `plr.Plate`, `None`.
    Name(String),
    /// A subscripted generic: `list[Well]`, `dict[str, Plate]`.
    Generic { base: String, args: Vec<TypeExpr> },
    /// `A | B`, `Union[A, B]`, `Optional[A]` (with an explicit `None` arm).
    Union(Vec<TypeExpr>),
    /// A bracketed argument list without a base, as in `Callable[[A], B]`.
    List(Vec<TypeExpr>),
    /// `...` inside `tuple[X, ...]`.
    Ellipsis,
    /// Literal values (numbers, strings inside `Literal[...]`).
    Literal(String),
}

const SEQUENCE_BASES: &[&str] = &[
    "list",
    "List",
    "tuple",
    "Tuple",
    "set",
    "Set",
    "frozenset",
    "FrozenSet",
    "Sequence",
    "MutableSequence",
    "Iterable",
    "Iterator",
    "Collection",
];

const MAPPING_BASES: &[&str] = &["dict", "Dict", "Mapping", "MutableMapping"];

fn base_name(base: &str) -> &str {
    base.rsplit('.').next().unwrap_or(base)
}

fn is_container_base(base: &str) -> bool {
    let b = base_name(base);
    SEQUENCE_BASES.contains(&b) || MAPPING_BASES.contains(&b)
}

// ---- tokenizer ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    Open,
    Close,
    Comma,
    Pipe,
    Ellipsis,
}

fn tokenize(text: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '[' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ']' => {
                tokens.push(Token::Close);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '.' if chars[i..].starts_with(&['.', '.', '.']) => {
                tokens.push(Token::Ellipsis);
                i += 3;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return None;
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

// ---- parser ----

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

const MAX_NESTING: usize = 32;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn union(&mut self, literal_context: bool) -> Option<TypeExpr> {
        let mut arms = vec![self.primary(literal_context)?];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            arms.push(self.primary(literal_context)?);
        }
        if arms.len() == 1 {
            arms.pop()
        } else {
            Some(TypeExpr::Union(arms))
        }
    }

    fn args(&mut self, literal_context: bool) -> Option<Vec<TypeExpr>> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return None;
        }
        let mut args = Vec::new();
        loop {
            if self.peek() == Some(&Token::Close) {
                self.pos += 1;
                break;
            }
            args.push(self.union(literal_context)?);
            match self.next()? {
                Token::Comma => continue,
                Token::Close => break,
                _ => return None,
            }
        }
        self.depth -= 1;
        Some(args)
    }

    fn primary(&mut self, literal_context: bool) -> Option<TypeExpr> {
        match self.next()? {
            Token::Ident(name) => {
                if self.peek() != Some(&Token::Open) {
                    return Some(TypeExpr::Name(name));
                }
                self.pos += 1;
                let is_literal = base_name(&name) == "Literal";
                let args = self.args(is_literal)?;
                match base_name(&name) {
                    "Union" => Some(TypeExpr::Union(args)),
                    "Optional" => {
                        let mut arms = args;
                        arms.push(TypeExpr::Name("None".to_string()));
                        Some(TypeExpr::Union(arms))
                    }
                    _ => Some(TypeExpr::Generic { base: name, args }),
                }
            }
            Token::Str(text) if literal_context => Some(TypeExpr::Literal(text)),
            // Forward reference: the string holds another annotation.
            Token::Str(text) => parse_type_expr(&text),
            Token::Number(text) => Some(TypeExpr::Literal(text)),
            Token::Ellipsis => Some(TypeExpr::Ellipsis),
            Token::Open => Some(TypeExpr::List(self.args(literal_context)?)),
            _ => None,
        }
    }
}

/// Parse annotation text. Returns `None` when the text is not a well-formed
/// annotation.
pub fn parse_type_expr(text: &str) -> Option<TypeExpr> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return None;
    }
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let expr = parser.union(false)?;
    if parser.pos != parser.tokens.len() {
        return None;
    }
    Some(expr)
}

impl TypeExpr {
    /// Kinds referenced anywhere in the expression, in textual order,
    /// without duplicates.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut out = Vec::new();
        self.collect_kinds(&mut out);
        out
    }

    fn collect_kinds(&self, out: &mut Vec<ResourceKind>) {
        match self {
            TypeExpr::Name(name) => {
                if let Some(kind) = ResourceKind::from_name(name) {
                    if !out.contains(&kind) {
                        out.push(kind);
                    }
                }
            }
            TypeExpr::Generic { base, args } => {
                let base = base_name(base);
                if base == "Literal" {
                    return;
                }
                if let Some(kind) = ResourceKind::from_name(base) {
                    if !out.contains(&kind) {
                        out.push(kind);
                    }
                }
                // Annotated[X, metadata...] only types X.
                let args: &[TypeExpr] = if base == "Annotated" { &args[..args.len().min(1)] } else { args };
                for arg in args {
                    arg.collect_kinds(out);
                }
            }
            TypeExpr::Union(arms) | TypeExpr::List(arms) => {
                for arm in arms {
                    arm.collect_kinds(out);
                }
            }
            TypeExpr::Ellipsis | TypeExpr::Literal(_) => {}
        }
    }

    fn is_none(&self) -> bool {
        matches!(self, TypeExpr::Name(n) if n == "None")
    }

    /// Union arms with `None` removed; a non-union is its own single arm.
    fn arms(&self) -> Vec<&TypeExpr> {
        match self {
            TypeExpr::Union(arms) => arms.iter().flat_map(|a| a.arms()).filter(|a| !a.is_none()).collect(),
            TypeExpr::Generic { base, args } if base_name(base) == "Annotated" && !args.is_empty() => {
                args[0].arms()
            }
            other => vec![other],
        }
    }

    /// Element kind of a container expression, when uniform.
    fn element_kind(&self) -> Option<ResourceKind> {
        let TypeExpr::Generic { base, args } = self else {
            return None;
        };
        let base = base_name(base);
        if MAPPING_BASES.contains(&base) {
            return args.last().and_then(|a| a.kinds().first().copied());
        }
        let mut element = None;
        for arg in args.iter().filter(|a| !matches!(a, TypeExpr::Ellipsis)) {
            let kind = arg.kinds().first().copied()?;
            match element {
                None => element = Some(kind),
                Some(prev) if prev == kind => {}
                Some(_) => return None,
            }
        }
        element
    }

    fn is_container(&self) -> bool {
        matches!(self, TypeExpr::Generic { base, .. } if is_container_base(base))
    }
}

/// A parameter's declared type, reduced to what the analyzer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredType {
    /// Annotation text as written; empty when unannotated or synthesized.
    pub text: String,
    /// Kinds referenced, union arms in declared order.
    pub kinds: Vec<ResourceKind>,
    /// True when every arm is a container type.
    pub collection: bool,
    /// Uniform element kind of the container, if any.
    pub element: Option<ResourceKind>,
    /// The annotation admits `None`.
    pub optional: bool,
}

/// How a subscript key is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    /// Integer index.
    Index,
    /// Slice `a:b`.
    Slice,
    /// Label or range key such as `"A1"` or `"A1:H1"`.
    Label,
    /// A key only known at runtime.
    Unknown,
}

impl DeclaredType {
    /// Reduce annotation text. Never fails: unrecognized text gives a type
    /// with no kinds.
    pub fn parse(text: &str) -> Self {
        let Some(expr) = parse_type_expr(text) else {
            return DeclaredType { text: text.to_string(), ..DeclaredType::unknown() };
        };
        let arms = expr.arms();
        let optional = matches!(&expr, TypeExpr::Union(a) if a.iter().any(TypeExpr::is_none));
        let collection = !arms.is_empty() && arms.iter().all(|a| a.is_container());
        let element = if collection { arms.iter().find_map(|a| a.element_kind()) } else { None };
        DeclaredType {
            text: text.to_string(),
            kinds: expr.kinds(),
            collection,
            element,
            optional,
        }
    }

    /// No annotation, or a value of unknown type.
    pub fn unknown() -> Self {
        DeclaredType {
            text: String::new(),
            kinds: Vec::new(),
            collection: false,
            element: None,
            optional: false,
        }
    }

    /// The type of a value derived by member access or subscript.
    pub fn from_shape(shape: Shape) -> Self {
        match shape {
            Shape::Single(kind) => DeclaredType {
                text: kind.name().to_string(),
                kinds: vec![kind],
                collection: false,
                element: None,
                optional: false,
            },
            Shape::Collection(kind) => DeclaredType {
                text: format!("list[{kind}]"),
                kinds: vec![kind],
                collection: true,
                element: Some(kind),
                optional: false,
            },
        }
    }

    /// True when at least one resource kind is referenced.
    pub fn is_resource(&self) -> bool {
        !self.kinds.is_empty()
    }

    /// The kind of a single value: the first declared arm.
    pub fn primary(&self) -> Option<ResourceKind> {
        if self.collection {
            None
        } else {
            self.kinds.first().copied()
        }
    }

    /// The kind whose containment chain applies: the element for
    /// collections, the first arm otherwise.
    pub fn placement_kind(&self) -> Option<ResourceKind> {
        if self.collection {
            self.element.or_else(|| self.kinds.first().copied())
        } else {
            self.primary()
        }
    }

    /// Resolve a member; union arms are tried in declared order.
    pub fn member_shape(&self, member: &str) -> Option<Shape> {
        if self.collection {
            return None;
        }
        self.kinds.iter().find_map(|k| k.member_shape(member))
    }

    /// Resolve a subscript; union arms are tried in declared order.
    pub fn subscript_shape(&self, key: KeyClass) -> Option<Shape> {
        if self.collection {
            let element = self.element?;
            return match key {
                KeyClass::Index | KeyClass::Unknown => Some(Shape::Single(element)),
                KeyClass::Slice => Some(Shape::Collection(element)),
                KeyClass::Label => None,
            };
        }
        self.kinds.iter().find_map(|k| k.subscript_shape())
    }
}

/// The set of resource kinds an annotation references. Pure and total.
pub fn inspect(text: &str) -> BTreeSet<ResourceKind> {
    DeclaredType::parse(text).kinds.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(kinds: &[ResourceKind]) -> BTreeSet<ResourceKind> {
        kinds.iter().copied().collect()
    }

    #[test]
    fn nested_generic_tuple() {
        assert_eq!(
            inspect("tuple[Plate, list[Well]]"),
            set(&[ResourceKind::Plate, ResourceKind::Well])
        );
    }

    #[test]
    fn union_arms_keep_declared_order() {
        let ty = DeclaredType::parse("TipRack | Plate");
        assert_eq!(ty.kinds, vec![ResourceKind::TipRack, ResourceKind::Plate]);
        assert_eq!(ty.primary(), Some(ResourceKind::TipRack));
        // TipRack is tried first, so subscripting yields tip spots.
        assert_eq!(
            ty.subscript_shape(KeyClass::Label),
            Some(Shape::Collection(ResourceKind::TipSpot))
        );
    }

    #[test]
    fn optional_and_forward_refs() {
        let ty = DeclaredType::parse("Optional[\"TipRack\"]");
        assert_eq!(ty.kinds, vec![ResourceKind::TipRack]);
        assert!(ty.optional);
        assert!(!ty.collection);

        let ty = DeclaredType::parse("'plr.Plate'");
        assert_eq!(ty.primary(), Some(ResourceKind::Plate));
    }

    #[test]
    fn list_of_wells_is_collection() {
        let ty = DeclaredType::parse("List[Well]");
        assert!(ty.collection);
        assert_eq!(ty.element, Some(ResourceKind::Well));
        assert_eq!(ty.placement_kind(), Some(ResourceKind::Well));
        assert_eq!(ty.subscript_shape(KeyClass::Index), Some(Shape::Single(ResourceKind::Well)));
        assert_eq!(
            ty.subscript_shape(KeyClass::Slice),
            Some(Shape::Collection(ResourceKind::Well))
        );
    }

    #[test]
    fn heterogeneous_tuple_has_no_element() {
        let ty = DeclaredType::parse("tuple[Plate, TipRack]");
        assert!(ty.collection);
        assert_eq!(ty.element, None);
        let ty = DeclaredType::parse("tuple[Plate, ...]");
        assert_eq!(ty.element, Some(ResourceKind::Plate));
    }

    #[test]
    fn mapping_element_is_value_type() {
        let ty = DeclaredType::parse("dict[str, Plate]");
        assert!(ty.collection);
        assert_eq!(ty.element, Some(ResourceKind::Plate));
    }

    #[test]
    fn literal_and_annotated() {
        assert!(inspect("Literal['Plate', 'Well']").is_empty());
        assert_eq!(inspect("Annotated[Plate, 'Well']"), set(&[ResourceKind::Plate]));
    }

    #[test]
    fn unrecognized_text_is_empty() {
        assert!(inspect("").is_empty());
        assert!(inspect("float").is_empty());
        assert!(inspect("list[").is_empty());
        assert!(inspect("Callable[[int], None]").is_empty());
        assert!(inspect("@@@").is_empty());
    }

    fn leaf() -> impl Strategy<Value = (String, BTreeSet<ResourceKind>)> {
        prop::sample::select(ResourceKind::ALL.to_vec())
            .prop_map(|k| (k.name().to_string(), set(&[k])))
    }

    fn expr() -> impl Strategy<Value = (String, BTreeSet<ResourceKind>)> {
        leaf().prop_recursive(4, 24, 3, |inner| {
            let pair = (inner.clone(), inner.clone());
            prop_oneof![
                inner.clone().prop_map(|(t, k)| (format!("list[{t}]"), k)),
                inner.clone().prop_map(|(t, k)| (format!("Optional[{t}]"), k)),
                inner.clone().prop_map(|(t, k)| (format!("Sequence[{t}]"), k)),
                inner.clone().prop_map(|(t, k)| (format!("dict[str, {t}]"), k)),
                pair.clone().prop_map(|((a, ka), (b, kb))| {
                    (format!("tuple[{a}, {b}]"), ka.union(&kb).copied().collect())
                }),
                pair.clone().prop_map(|((a, ka), (b, kb))| {
                    (format!("{a} | {b}"), ka.union(&kb).copied().collect())
                }),
                pair.prop_map(|((a, ka), (b, kb))| {
                    (format!("Union[{a}, {b}]"), ka.union(&kb).copied().collect())
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn extracted_kinds_equal_textual_kinds((text, expected) in expr()) {
            prop_assert_eq!(inspect(&text), expected);
        }

        #[test]
        fn inspection_never_panics(text in "\\PC{0,40}") {
            let _ = inspect(&text);
        }
    }
}
