use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// An ESI variable or function argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Boolean(bool),
    List(Vec<String>),
    Dictionary(BTreeMap<String, String>),
    Null,
}

impl Value {
    /// Looks up `key` in a list (by position) or a dictionary (by key).
    pub fn index(&self, key: &str) -> Option<&str> {
        match self {
            Value::List(items) => key
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .map(String::as_str),
            Value::Dictionary(map) => map.get(key).map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::List(items) => f.write_str(&items.join(",")),
            Value::Dictionary(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "'{k}':'{v}'")?;
                }
                f.write_str("}")
            }
            Value::Null => Ok(()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// A user-defined function captured from `<esi:function>`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    /// Raw markup between the function tags; never executed at definition time.
    pub body: String,
    /// Indices of the `ARGS{n}` placeholders referenced by the body, ascending.
    pub parameters: Vec<usize>,
}

/// State shared by every resolver during one processing invocation.
///
/// Variables are global to the pass: there is no block scoping, and a second
/// assignment to the same name overwrites the first.
#[derive(Debug, Default)]
pub struct EvalContext {
    variables: HashMap<String, Value>,
    functions: HashMap<String, FunctionDef>,
    break_requested: bool,
    return_value: Option<Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`. Storing `Value::Null` makes the variable absent.
    pub fn set_variable(&mut self, name: &str, value: Value) {
        match value {
            Value::Null => {
                self.variables.remove(name);
            }
            _ => {
                self.variables.insert(name.to_string(), value);
            }
        };
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn set_function(&mut self, name: &str, def: FunctionDef) {
        self.functions.insert(name.to_string(), def);
    }

    pub fn get_function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    pub fn set_break(&mut self) {
        self.break_requested = true;
    }

    pub fn is_break(&self) -> bool {
        self.break_requested
    }

    pub fn clear_break(&mut self) {
        self.break_requested = false;
    }

    pub fn set_return(&mut self, value: Value) {
        self.return_value = Some(value);
    }

    pub fn get_return(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    pub fn clear_return(&mut self) {
        self.return_value = None;
    }
}

impl<const N: usize> From<[(&str, Value); N]> for EvalContext {
    fn from(data: [(&str, Value); N]) -> EvalContext {
        let mut ctx = EvalContext::new();
        for (name, value) in data {
            ctx.set_variable(name, value);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut ctx = EvalContext::new();
        ctx.set_variable("a", Value::from("one"));
        ctx.set_variable("a", Value::from("two"));
        assert_eq!(ctx.get_variable("a"), Some(&Value::from("two")));
    }

    #[test]
    fn test_null_makes_variable_absent() {
        let mut ctx = EvalContext::from([("a", Value::Boolean(true))]);
        assert!(ctx.has_variable("a"));
        ctx.set_variable("a", Value::Null);
        assert!(!ctx.has_variable("a"));
        assert_eq!(ctx.get_variable("a"), None);
    }

    #[test]
    fn test_break_and_return_slots() {
        let mut ctx = EvalContext::new();
        assert!(!ctx.is_break());
        ctx.set_break();
        assert!(ctx.is_break());
        ctx.clear_break();
        assert!(!ctx.is_break());

        assert_eq!(ctx.get_return(), None);
        ctx.set_return(Value::Number(3.0));
        assert_eq!(ctx.get_return(), Some(&Value::Number(3.0)));
        ctx.clear_return();
        assert_eq!(ctx.get_return(), None);
    }

    #[test]
    fn test_functions() {
        let mut ctx = EvalContext::new();
        assert!(ctx.get_function("f").is_none());
        ctx.set_function(
            "f",
            FunctionDef {
                name: "f".to_string(),
                body: "$(ARGS{0})".to_string(),
                parameters: vec![0],
            },
        );
        assert_eq!(ctx.get_function("f").map(|f| f.parameters.clone()), Some(vec![0]));
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(Value::Number(42.0).to_string(), "42");
        assert_eq!(Value::Number(1.5).to_string(), "1.5");
        assert_eq!(Value::Boolean(false).to_string(), "false");
        assert_eq!(
            Value::List(vec!["a".to_string(), "b".to_string()]).to_string(),
            "a,b"
        );
        let dict = Value::Dictionary(BTreeMap::from([
            ("de".to_string(), "Germany".to_string()),
            ("at".to_string(), "Austria".to_string()),
        ]));
        assert_eq!(dict.to_string(), "{'at':'Austria','de':'Germany'}");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn test_index() {
        let list = Value::List(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(list.index("1"), Some("b"));
        assert_eq!(list.index("7"), None);
        assert_eq!(list.index("x"), None);
        let dict = Value::Dictionary(BTreeMap::from([("k".to_string(), "v".to_string())]));
        assert_eq!(dict.index("k"), Some("v"));
        assert_eq!(Value::from("abc").index("0"), None);
    }
}
