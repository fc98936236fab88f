use std::sync::Arc;

use crate::value::Value;

// ---------------------------------------------------------------------------
// Env — immutable, structure-sharing bindings
// ---------------------------------------------------------------------------

/// What a name is bound to: a value, or a namespace of further bindings
/// (call outputs, import namespaces).
#[derive(Debug, Clone)]
pub enum Binding {
    Value(Value),
    Namespace(Env),
}

#[derive(Debug)]
struct Frame {
    name: String,
    binding: Binding,
    prev: Option<Arc<Frame>>,
}

/// A lexically-scoped environment: an immutable list of frames. `bind`
/// returns a new environment sharing structure with the old one; lookup
/// walks frames newest-first and resolves dotted names through
/// namespaces.
#[derive(Debug, Clone, Default)]
pub struct Env {
    head: Option<Arc<Frame>>,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    /// Bind a value, shadowing any existing binding of the same name.
    pub fn bind(&self, name: impl Into<String>, value: Value) -> Env {
        self.bind_binding(name, Binding::Value(value))
    }

    /// Bind a namespace (e.g. a call's outputs).
    pub fn bind_namespace(&self, name: impl Into<String>, ns: Env) -> Env {
        self.bind_binding(name, Binding::Namespace(ns))
    }

    fn bind_binding(&self, name: impl Into<String>, binding: Binding) -> Env {
        Env {
            head: Some(Arc::new(Frame {
                name: name.into(),
                binding,
                prev: self.head.clone(),
            })),
        }
    }

    /// Look up a (possibly dotted) name.
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        match name.split_once('.') {
            None => self.lookup_flat(name),
            Some((head, rest)) => match self.lookup_flat(head)? {
                Binding::Namespace(ns) => ns.lookup(rest),
                Binding::Value(_) => None,
            },
        }
    }

    /// Look up a value, refusing namespaces.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.lookup(name)? {
            Binding::Value(v) => Some(v),
            Binding::Namespace(_) => None,
        }
    }

    fn lookup_flat(&self, name: &str) -> Option<&Binding> {
        let mut frame = self.head.as_deref();
        while let Some(f) = frame {
            if f.name == name {
                return Some(&f.binding);
            }
            frame = f.prev.as_deref();
        }
        None
    }

    /// Iterate bindings newest-first (shadowed entries included last).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        EnvIter {
            frame: self.head.as_deref(),
        }
    }
}

struct EnvIter<'a> {
    frame: Option<&'a Frame>,
}

impl<'a> Iterator for EnvIter<'a> {
    type Item = (&'a str, &'a Binding);

    fn next(&mut self) -> Option<Self::Item> {
        let f = self.frame?;
        self.frame = f.prev.as_deref();
        Some((f.name.as_str(), &f.binding))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_shares_structure() {
        let base = Env::new().bind("a", Value::Int(1));
        let one = base.bind("b", Value::Int(2));
        let two = base.bind("b", Value::Int(3));
        assert_eq!(one.value("b"), Some(&Value::Int(2)));
        assert_eq!(two.value("b"), Some(&Value::Int(3)));
        assert_eq!(one.value("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn shadowing_prefers_newest() {
        let env = Env::new().bind("x", Value::Int(1)).bind("x", Value::Int(2));
        assert_eq!(env.value("x"), Some(&Value::Int(2)));
    }

    #[test]
    fn dotted_lookup_through_namespace() {
        let outputs = Env::new().bind("out", Value::Int(42));
        let env = Env::new().bind_namespace("task1", outputs);
        assert_eq!(env.value("task1.out"), Some(&Value::Int(42)));
        assert!(env.value("task1").is_none());
        assert!(env.value("task1.missing").is_none());
    }
}
