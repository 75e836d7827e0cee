use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use sstemplate::expr::{BinaryOperator, Expr, UnaryOperator};

use crate::environment::Environment;
use crate::error::{DiagnosticError, RuntimeError};
use crate::runtime_value::RuntimeValue;

/// How a missing field is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    /// Missing field is an error. Used for cache keys and cache conditions,
    /// where an empty value could make distinct content share one entry.
    Strict,
    /// Missing field evaluates to Null.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    position: Vec<usize>,
    expr: String,
}

/// A strict result found every field it read, so it also answers lenient
/// lookups. A lenient result may hide a missing field and answers only
/// lenient lookups.
#[derive(Debug, Clone)]
struct Memoized {
    value: RuntimeValue,
    strict: bool,
}

/// Evaluates expressions for one render pass, remembering every result by
/// data-context position and canonical expression text. Dropped with the pass.
#[derive(Debug)]
pub struct ExpressionMemo {
    entries: HashMap<MemoKey, Memoized>,
    /// Real evaluations per canonical expression.
    evaluated: BTreeMap<String, usize>,
    hits: usize,
    source_id: usize,
}

impl ExpressionMemo {
    pub fn new(source_id: usize) -> Self {
        ExpressionMemo {
            entries: HashMap::new(),
            evaluated: BTreeMap::new(),
            hits: 0,
            source_id,
        }
    }

    pub fn evaluate(
        &mut self,
        expr: &Expr,
        env: &Environment,
        lookup: Lookup,
    ) -> Result<RuntimeValue, DiagnosticError> {
        let key = MemoKey {
            position: env.position(),
            expr: expr.to_string(),
        };
        if let Some(memoized) = self.entries.get(&key) {
            if memoized.strict || lookup == Lookup::Lenient {
                self.hits += 1;
                return Ok(memoized.value.clone());
            }
        }

        let value = evaluate(expr, env, lookup, self.source_id)?;
        *self.evaluated.entry(key.expr.clone()).or_default() += 1;
        self.entries.insert(
            key,
            Memoized {
                value: value.clone(),
                strict: lookup == Lookup::Strict,
            },
        );
        Ok(value)
    }

    pub fn evaluated(&self) -> &BTreeMap<String, usize> {
        &self.evaluated
    }

    pub fn hits(&self) -> usize {
        self.hits
    }
}

/// Evaluate an expression against the data context, without memoization.
pub fn evaluate(
    expr: &Expr,
    env: &Environment,
    lookup: Lookup,
    source_id: usize,
) -> Result<RuntimeValue, DiagnosticError> {
    match expr {
        Expr::StringLiteral(s) => Ok(RuntimeValue::String(s.clone())),
        Expr::NumberLiteral(n) => Ok(RuntimeValue::Number(*n)),
        Expr::BooleanLiteral(b) => Ok(RuntimeValue::Boolean(*b)),
        Expr::Null => Ok(RuntimeValue::Null),

        Expr::Path(path, span) => match env.lookup(path) {
            Some(value) => Ok(value),
            None => match lookup {
                Lookup::Lenient => Ok(RuntimeValue::Null),
                Lookup::Strict => Err(DiagnosticError::at(
                    RuntimeError::UndefinedField(path.to_string()),
                    Some(span.clone()),
                    source_id,
                )),
            },
        },

        Expr::UnaryOperation { operator, operand } => {
            let value = evaluate(operand, env, lookup, source_id)?;
            match operator {
                UnaryOperator::LogicalNot => Ok(RuntimeValue::Boolean(value.is_falsy())),
                UnaryOperator::Negation => match value.as_number() {
                    Some(n) => Ok(RuntimeValue::Number(-n)),
                    None => Err(DiagnosticError::at(
                        RuntimeError::TypeError {
                            expected: "Number".into(),
                            got: value.type_name().into(),
                        },
                        operand.span(),
                        source_id,
                    )),
                },
            }
        }

        Expr::BinaryOperation {
            operator,
            left,
            right,
        } => {
            let l = evaluate(left, env, lookup, source_id)?;
            // Logical operators short-circuit: the right side is not evaluated
            // (and cannot fail) once the result is known.
            match operator {
                BinaryOperator::LogicalAnd if l.is_falsy() => return Ok(RuntimeValue::Boolean(false)),
                BinaryOperator::LogicalOr if l.is_truthy() => return Ok(RuntimeValue::Boolean(true)),
                _ => {}
            }
            let r = evaluate(right, env, lookup, source_id)?;
            Ok(RuntimeValue::Boolean(eval_binary_op(*operator, &l, &r)))
        }
    }
}

fn eval_binary_op(operator: BinaryOperator, l: &RuntimeValue, r: &RuntimeValue) -> bool {
    match operator {
        BinaryOperator::LogicalAnd | BinaryOperator::LogicalOr => r.is_truthy(),
        BinaryOperator::Equality => loose_eq(l, r),
        BinaryOperator::Inequality => !loose_eq(l, r),
        BinaryOperator::GreaterThan => compare(l, r) == Ordering::Greater,
        BinaryOperator::LessThan => compare(l, r) == Ordering::Less,
        BinaryOperator::GreaterThanOrEqual => compare(l, r) != Ordering::Less,
        BinaryOperator::LessThanOrEqual => compare(l, r) != Ordering::Greater,
    }
}

/// Numbers compare numerically when either side is a number; everything
/// else compares by rendered text.
fn loose_eq(l: &RuntimeValue, r: &RuntimeValue) -> bool {
    let numeric = matches!(l, RuntimeValue::Number(_)) || matches!(r, RuntimeValue::Number(_));
    if numeric {
        if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
            return a == b;
        }
    }
    l.to_string() == r.to_string()
}

fn compare(l: &RuntimeValue, r: &RuntimeValue) -> Ordering {
    match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => l.to_string().cmp(&r.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sstemplate::parser::expression::parse_expression;

    fn env() -> Environment {
        Environment::new(RuntimeValue::record([
            ("A", RuntimeValue::from(5i64)),
            ("Zero", RuntimeValue::from(0i64)),
            ("Name", RuntimeValue::from("beta")),
            ("Count", RuntimeValue::from("10")),
        ]))
    }

    fn eval(source: &str, lookup: Lookup) -> Result<RuntimeValue, DiagnosticError> {
        let expr = parse_expression(source, 0, 0).unwrap();
        evaluate(&expr, &env(), lookup, 0)
    }

    #[test]
    fn comparisons() {
        assert_eq!(eval("$A > 0", Lookup::Strict).unwrap(), RuntimeValue::from(true));
        assert_eq!(eval("$Zero > 0", Lookup::Strict).unwrap(), RuntimeValue::from(false));
        assert_eq!(eval("$Count > 9", Lookup::Strict).unwrap(), RuntimeValue::from(true));
        assert_eq!(eval("$Name = 'beta'", Lookup::Strict).unwrap(), RuntimeValue::from(true));
        assert_eq!(eval("$Name < 'gamma'", Lookup::Strict).unwrap(), RuntimeValue::from(true));
        assert_eq!(eval("$Count == 10", Lookup::Strict).unwrap(), RuntimeValue::from(true));
        assert_eq!(eval("$A != 5", Lookup::Strict).unwrap(), RuntimeValue::from(false));
    }

    #[test]
    fn strict_missing_field_is_an_error_with_span() {
        let err = eval("$A > 0 && $Missing.Field", Lookup::Strict).unwrap_err();
        assert!(matches!(err.error, RuntimeError::UndefinedField(ref f) if f == "$Missing.Field"));
        assert_eq!(err.span, Some(10..24));
    }

    #[test]
    fn lenient_missing_field_is_null() {
        assert_eq!(eval("$Missing", Lookup::Lenient).unwrap(), RuntimeValue::Null);
        assert_eq!(eval("not $Missing", Lookup::Lenient).unwrap(), RuntimeValue::from(true));
    }

    #[test]
    fn short_circuit_skips_missing_right_side() {
        assert_eq!(eval("$Zero && $Missing", Lookup::Strict).unwrap(), RuntimeValue::from(false));
        assert_eq!(eval("$A || $Missing", Lookup::Strict).unwrap(), RuntimeValue::from(true));
    }

    #[test]
    fn negating_a_string_is_a_type_error() {
        let err = eval("-$Name", Lookup::Strict).unwrap_err();
        assert!(matches!(err.error, RuntimeError::TypeError { .. }));
    }

    #[test]
    fn memo_evaluates_once_per_position() {
        let mut env = env();
        let mut memo = ExpressionMemo::new(0);
        let expr = parse_expression("$A", 0, 0).unwrap();
        let same_text_elsewhere = parse_expression("$A", 100, 0).unwrap();

        memo.evaluate(&expr, &env, Lookup::Strict).unwrap();
        memo.evaluate(&same_text_elsewhere, &env, Lookup::Strict).unwrap();
        assert_eq!(memo.evaluated().get("$A"), Some(&1));
        assert_eq!(memo.hits(), 1);

        env.push_loop_item(RuntimeValue::record([("A", RuntimeValue::from(1i64))]), 0, 1);
        let inner = memo.evaluate(&expr, &env, Lookup::Strict).unwrap();
        assert_eq!(inner, RuntimeValue::from(1i64));
        assert_eq!(memo.evaluated().get("$A"), Some(&2));
    }

    #[test]
    fn strict_result_answers_lenient_lookup() {
        let env = env();
        let mut memo = ExpressionMemo::new(0);
        let expr = parse_expression("$A", 0, 0).unwrap();

        memo.evaluate(&expr, &env, Lookup::Strict).unwrap();
        let lenient = memo.evaluate(&expr, &env, Lookup::Lenient).unwrap();
        assert_eq!(lenient, RuntimeValue::from(5i64));
        assert_eq!(memo.evaluated().get("$A"), Some(&1));
        assert_eq!(memo.hits(), 1);
    }

    #[test]
    fn lenient_result_does_not_hide_a_missing_field_from_strict_lookup() {
        let env = env();
        let mut memo = ExpressionMemo::new(0);
        let expr = parse_expression("$Missing", 0, 0).unwrap();

        assert_eq!(memo.evaluate(&expr, &env, Lookup::Lenient).unwrap(), RuntimeValue::Null);
        let err = memo.evaluate(&expr, &env, Lookup::Strict).unwrap_err();
        assert!(matches!(err.error, RuntimeError::UndefinedField(_)));
    }
}
