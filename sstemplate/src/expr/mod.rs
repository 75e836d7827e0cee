use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOperator {
    /// Arithmetic negation: -x
    Negation,
    /// Logical not: !x / not x
    LogicalNot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOperator {
    LogicalAnd,
    LogicalOr,
    Equality,
    Inequality,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
}

impl BinaryOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::LogicalAnd => "&&",
            BinaryOperator::LogicalOr => "||",
            BinaryOperator::Equality => "==",
            BinaryOperator::Inequality => "!=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::LessThan => "<",
            BinaryOperator::GreaterThanOrEqual => ">=",
            BinaryOperator::LessThanOrEqual => "<=",
        }
    }
}

/// A dotted field path such as `$CurrentUser.ID`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    pub segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        FieldPath { segments }
    }

    pub fn head(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.segments.join("."))
    }
}

/// An expression appearing in `$Field` interpolations and in tag arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    StringLiteral(String),
    NumberLiteral(f64),
    BooleanLiteral(bool),
    Null,

    /// `$Field.Sub`, with the byte span of the reference in the source.
    Path(FieldPath, Range<usize>),

    UnaryOperation {
        operator: UnaryOperator,
        operand: Box<Expr>,
    },
    BinaryOperation {
        operator: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn path(segments: &[&str], span: Range<usize>) -> Self {
        Expr::Path(
            FieldPath::new(segments.iter().map(|s| s.to_string()).collect()),
            span,
        )
    }

    /// Best-effort source span: the first field reference inside the expression.
    pub fn span(&self) -> Option<Range<usize>> {
        match self {
            Expr::Path(_, span) => Some(span.clone()),
            Expr::UnaryOperation { operand, .. } => operand.span(),
            Expr::BinaryOperation { left, right, .. } => match (left.span(), right.span()) {
                (Some(l), Some(r)) => Some(l.start.min(r.start)..l.end.max(r.end)),
                (l, r) => l.or(r),
            },
            _ => None,
        }
    }
}

/// Canonical form. Two expressions with the same canonical form evaluate
/// identically in the same data context.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::StringLiteral(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Expr::NumberLiteral(n) => {
                if n.is_finite() && *n == n.floor() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Expr::BooleanLiteral(b) => write!(f, "{}", b),
            Expr::Null => write!(f, "null"),
            Expr::Path(path, _) => write!(f, "{}", path),
            Expr::UnaryOperation { operator, operand } => match operator {
                UnaryOperator::Negation => write!(f, "-{}", operand),
                UnaryOperator::LogicalNot => write!(f, "!{}", operand),
            },
            Expr::BinaryOperation {
                operator,
                left,
                right,
            } => write!(f, "({} {} {})", left, operator.symbol(), right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_ignores_spans() {
        let a = Expr::path(&["Page", "ID"], 0..8);
        let b = Expr::path(&["Page", "ID"], 40..48);
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "$Page.ID");
    }

    #[test]
    fn canonical_form_of_comparison() {
        let expr = Expr::BinaryOperation {
            operator: BinaryOperator::GreaterThan,
            left: Box::new(Expr::path(&["A"], 0..2)),
            right: Box::new(Expr::NumberLiteral(0.0)),
        };
        assert_eq!(expr.to_string(), "($A > 0)");
        assert_eq!(expr.span(), Some(0..2));
    }
}
