use sstemplate::expr::FieldPath;

use crate::runtime_value::RuntimeValue;

/// Iteration state of the loop that pushed a scope.
#[derive(Debug, Clone, Copy)]
struct LoopInfo {
    /// 0-based index of the current item.
    index: usize,
    total: usize,
    /// Distinct for every scope pushed during one pass.
    serial: usize,
}

/// A single scope level: the render data at the root, or one loop item.
#[derive(Debug, Clone)]
pub struct Scope {
    value: RuntimeValue,
    loop_info: Option<LoopInfo>,
}

/// The data context is a stack of scopes. Field lookup searches from the
/// innermost scope outward.
#[derive(Debug)]
pub struct Environment {
    scopes: Vec<Scope>,
    pushed: usize,
}

impl Environment {
    pub fn new(root: RuntimeValue) -> Self {
        Environment {
            scopes: vec![Scope {
                value: root,
                loop_info: None,
            }],
            pushed: 0,
        }
    }

    /// Enter one iteration of a loop.
    pub fn push_loop_item(&mut self, item: RuntimeValue, index: usize, total: usize) {
        self.pushed += 1;
        self.scopes.push(Scope {
            value: item,
            loop_info: Some(LoopInfo {
                index,
                total,
                serial: self.pushed,
            }),
        });
    }

    /// Leave a loop iteration. The root scope is never popped.
    pub fn pop_scope(&mut self) -> Option<Scope> {
        if self.scopes.len() > 1 {
            self.scopes.pop()
        } else {
            None
        }
    }

    /// Identifies the current scope chain. Two evaluations at the same
    /// position see the same data; sibling loops never share a position.
    pub fn position(&self) -> Vec<usize> {
        self.scopes
            .iter()
            .filter_map(|s| s.loop_info.map(|info| info.serial))
            .collect()
    }

    /// 0-based iteration index of each enclosing loop, outermost first.
    pub fn loop_indices(&self) -> Vec<usize> {
        self.scopes
            .iter()
            .filter_map(|s| s.loop_info.map(|info| info.index))
            .collect()
    }

    pub fn depth(&self) -> usize {
        self.scopes.len() - 1
    }

    /// Resolve a field path. Returns None when any segment is missing.
    pub fn lookup(&self, path: &FieldPath) -> Option<RuntimeValue> {
        let mut segments = path.segments.iter();
        let head = segments.next()?;
        let mut current = self.lookup_head(head)?;
        for segment in segments {
            current = current.field(segment)?.clone();
        }
        Some(current)
    }

    fn lookup_head(&self, name: &str) -> Option<RuntimeValue> {
        let innermost = self.scopes.last()?;

        if let Some(value) = loop_field(innermost, name) {
            return Some(value);
        }
        match name {
            "Me" => return Some(innermost.value.clone()),
            "Top" => return self.scopes.first().map(|s| s.value.clone()),
            "Up" if self.scopes.len() > 1 => {
                return self.scopes.get(self.scopes.len() - 2).map(|s| s.value.clone());
            }
            _ => {}
        }

        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.value.field(name).cloned())
    }
}

/// Virtual fields available inside a loop iteration.
fn loop_field(scope: &Scope, name: &str) -> Option<RuntimeValue> {
    let info = scope.loop_info?;
    let value = match name {
        "Pos" => RuntimeValue::Number((info.index + 1) as f64),
        "TotalItems" => RuntimeValue::Number(info.total as f64),
        "First" => RuntimeValue::Boolean(info.index == 0),
        "Last" => RuntimeValue::Boolean(info.index + 1 == info.total),
        "Even" => RuntimeValue::Boolean((info.index + 1) % 2 == 0),
        "Odd" => RuntimeValue::Boolean((info.index + 1) % 2 == 1),
        "EvenOdd" => RuntimeValue::string(if (info.index + 1) % 2 == 0 { "even" } else { "odd" }),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> FieldPath {
        FieldPath::new(s.split('.').map(str::to_string).collect())
    }

    fn root() -> RuntimeValue {
        RuntimeValue::record([
            ("Title", RuntimeValue::from("Home")),
            (
                "CurrentUser",
                RuntimeValue::record([("ID", RuntimeValue::from(7i64))]),
            ),
        ])
    }

    #[test]
    fn nested_lookup() {
        let env = Environment::new(root());
        assert_eq!(env.lookup(&path("CurrentUser.ID")), Some(RuntimeValue::from(7i64)));
        assert_eq!(env.lookup(&path("CurrentUser.Name")), None);
        assert_eq!(env.lookup(&path("Missing")), None);
    }

    #[test]
    fn loop_scope_shadows_and_falls_back() {
        let mut env = Environment::new(root());
        env.push_loop_item(RuntimeValue::record([("Title", RuntimeValue::from("Item"))]), 1, 3);
        assert_eq!(env.lookup(&path("Title")), Some(RuntimeValue::from("Item")));
        assert_eq!(env.lookup(&path("Top.Title")), Some(RuntimeValue::from("Home")));
        assert_eq!(env.lookup(&path("Up.Title")), Some(RuntimeValue::from("Home")));
        assert_eq!(env.lookup(&path("CurrentUser.ID")), Some(RuntimeValue::from(7i64)));
        assert_eq!(env.lookup(&path("Pos")), Some(RuntimeValue::from(2i64)));
        assert_eq!(env.lookup(&path("Even")), Some(RuntimeValue::from(true)));
        assert_eq!(env.lookup(&path("Last")), Some(RuntimeValue::from(false)));
        assert_eq!(env.loop_indices(), vec![1]);
        env.pop_scope();
        assert_eq!(env.lookup(&path("Title")), Some(RuntimeValue::from("Home")));
        assert!(env.position().is_empty());
    }

    #[test]
    fn sibling_loops_have_distinct_positions() {
        let mut env = Environment::new(root());
        env.push_loop_item(RuntimeValue::Null, 0, 1);
        let first = env.position();
        env.pop_scope();
        env.push_loop_item(RuntimeValue::Null, 0, 1);
        assert_ne!(first, env.position());
        assert_eq!(env.loop_indices(), vec![0]);
    }

    #[test]
    fn root_scope_is_never_popped() {
        let mut env = Environment::new(root());
        assert!(env.pop_scope().is_none());
        assert_eq!(env.depth(), 0);
    }
}
