use std::fmt;

// ---------------------------------------------------------------------------
// Type — the WDL type lattice
// ---------------------------------------------------------------------------

/// A WDL type: a base kind plus the optional (`?`) quantifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub kind: TypeKind,
    pub optional: bool,
}

/// The closed set of WDL base kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TypeKind {
    Boolean,
    Int,
    Float,
    String,
    File,
    Directory,
    /// `Array[T]` with the nonempty (`+`) flag.
    Array { item: Box<Type>, nonempty: bool },
    Map { key: Box<Type>, value: Box<Type> },
    Pair { left: Box<Type>, right: Box<Type> },
    /// A named struct instance. Members are insertion-ordered; two struct
    /// types are equal iff their member lists coincide (the name is an
    /// alias and does not participate in equality).
    StructInstance {
        name: String,
        members: Vec<(String, Type)>,
    },
    /// Legacy untyped record; only usable to initialize structs and
    /// `Map[String,String]`.
    Object,
    /// Inference placeholder — unifies with any type.
    Any,
}

impl Type {
    pub fn new(kind: TypeKind) -> Self {
        Type {
            kind,
            optional: false,
        }
    }

    pub fn optional(kind: TypeKind) -> Self {
        Type {
            kind,
            optional: true,
        }
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// The same type with the optional quantifier cleared.
    pub fn required(&self) -> Type {
        Type {
            kind: self.kind.clone(),
            optional: false,
        }
    }

    pub fn boolean() -> Self {
        Type::new(TypeKind::Boolean)
    }
    pub fn int() -> Self {
        Type::new(TypeKind::Int)
    }
    pub fn float() -> Self {
        Type::new(TypeKind::Float)
    }
    pub fn string() -> Self {
        Type::new(TypeKind::String)
    }
    pub fn file() -> Self {
        Type::new(TypeKind::File)
    }
    pub fn directory() -> Self {
        Type::new(TypeKind::Directory)
    }
    pub fn any() -> Self {
        Type::new(TypeKind::Any)
    }
    pub fn object() -> Self {
        Type::new(TypeKind::Object)
    }

    pub fn array(item: Type) -> Self {
        Type::new(TypeKind::Array {
            item: Box::new(item),
            nonempty: false,
        })
    }

    pub fn array_nonempty(item: Type) -> Self {
        Type::new(TypeKind::Array {
            item: Box::new(item),
            nonempty: true,
        })
    }

    pub fn map(key: Type, value: Type) -> Self {
        Type::new(TypeKind::Map {
            key: Box::new(key),
            value: Box::new(value),
        })
    }

    pub fn pair(left: Type, right: Type) -> Self {
        Type::new(TypeKind::Pair {
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn is_any(&self) -> bool {
        matches!(self.kind, TypeKind::Any)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.kind, TypeKind::Int | TypeKind::Float)
    }

    /// Scalar kinds that coerce into `String` slots.
    pub fn is_stringable(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Boolean
                | TypeKind::Int
                | TypeKind::Float
                | TypeKind::String
                | TypeKind::File
                | TypeKind::Directory
        )
    }

    /// Lift this type through one enclosing scatter section.
    pub fn lifted_by_scatter(&self) -> Type {
        Type::new(TypeKind::Array {
            item: Box::new(self.clone()),
            nonempty: true,
        })
    }

    /// Lift this type through one enclosing conditional section.
    pub fn lifted_by_conditional(&self) -> Type {
        Type {
            kind: self.kind.clone(),
            optional: true,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TypeKind::Boolean => write!(f, "Boolean")?,
            TypeKind::Int => write!(f, "Int")?,
            TypeKind::Float => write!(f, "Float")?,
            TypeKind::String => write!(f, "String")?,
            TypeKind::File => write!(f, "File")?,
            TypeKind::Directory => write!(f, "Directory")?,
            TypeKind::Array { item, nonempty } => {
                write!(f, "Array[{item}]")?;
                if *nonempty {
                    write!(f, "+")?;
                }
            }
            TypeKind::Map { key, value } => write!(f, "Map[{key},{value}]")?,
            TypeKind::Pair { left, right } => write!(f, "Pair[{left},{right}]")?,
            TypeKind::StructInstance { name, .. } => write!(f, "{name}")?,
            TypeKind::Object => write!(f, "Object")?,
            TypeKind::Any => write!(f, "Any")?,
        }
        if self.optional {
            write!(f, "?")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coercion verdicts
// ---------------------------------------------------------------------------

/// Verdict of [`coerce`]: may a value of type `from` flow into a slot of
/// type `to`?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Ok,
    Warn(CoercionWarning),
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoercionWarning {
    /// `Int|Float|Boolean|File -> String`.
    StringCoercion,
    /// `String -> File` / `String -> Directory` at a slot boundary.
    FileCoercion,
    /// An empty array literal (`Array[Any]`) flowing into a nonempty slot.
    EmptyNonempty,
}

impl Coercion {
    pub fn is_err(self) -> bool {
        matches!(self, Coercion::Err)
    }

    /// Combine two verdicts, keeping the worst.
    fn and(self, other: Coercion) -> Coercion {
        match (self, other) {
            (Coercion::Err, _) | (_, Coercion::Err) => Coercion::Err,
            (Coercion::Warn(w), _) | (_, Coercion::Warn(w)) => Coercion::Warn(w),
            _ => Coercion::Ok,
        }
    }
}

/// Decide whether a value of type `from` may flow into a slot of type `to`.
///
/// Optionality is widened silently (`T -> T?`); the narrowing direction
/// (`T? -> T`) is *not* rejected here — [`check_quant`] owns that policy so
/// the checker can relax it by configuration.
pub fn coerce(from: &Type, to: &Type) -> Coercion {
    // Any on either side unifies with everything.
    if from.is_any() || to.is_any() {
        return Coercion::Ok;
    }

    match (&from.kind, &to.kind) {
        // Identity on the base kind.
        (a, b) if a == b => Coercion::Ok,

        // Numeric widening.
        (TypeKind::Int, TypeKind::Float) => Coercion::Ok,

        // Scalars into String slots.
        (
            TypeKind::Int | TypeKind::Float | TypeKind::Boolean | TypeKind::File
            | TypeKind::Directory,
            TypeKind::String,
        ) => Coercion::Warn(CoercionWarning::StringCoercion),

        // String into File/Directory slots.
        (TypeKind::String, TypeKind::File | TypeKind::Directory) => {
            Coercion::Warn(CoercionWarning::FileCoercion)
        }

        // Homogeneous container covariance.
        (
            TypeKind::Array {
                item: fi,
                nonempty: fne,
            },
            TypeKind::Array {
                item: ti,
                nonempty: tne,
            },
        ) => {
            let inner = coerce(fi, ti);
            if inner.is_err() {
                return Coercion::Err;
            }
            // An empty literal types as Array[Any]; only its runtime length
            // can satisfy the nonempty flag.
            if *tne && !*fne && fi.is_any() {
                return inner.and(Coercion::Warn(CoercionWarning::EmptyNonempty));
            }
            inner
        }
        (
            TypeKind::Map { key: fk, value: fv },
            TypeKind::Map { key: tk, value: tv },
        ) => coerce(fk, tk).and(coerce(fv, tv)),
        (
            TypeKind::Pair {
                left: fl,
                right: fr,
            },
            TypeKind::Pair {
                left: tl,
                right: tr,
            },
        ) => coerce(fl, tl).and(coerce(fr, tr)),

        // Struct-to-struct with identical member types (aliasing-insensitive).
        (
            TypeKind::StructInstance { members: fm, .. },
            TypeKind::StructInstance { members: tm, .. },
        ) => {
            if fm.len() != tm.len() {
                return Coercion::Err;
            }
            let mut verdict = Coercion::Ok;
            for (name, ty) in tm {
                match fm.iter().find(|(n, _)| n == name) {
                    Some((_, ft)) => verdict = verdict.and(coerce(ft, ty)),
                    None => return Coercion::Err,
                }
            }
            verdict
        }

        // Object literal initializing a struct by member name; member types
        // are checked per-value at runtime.
        (TypeKind::Object, TypeKind::StructInstance { .. }) => Coercion::Ok,
        // Object degrades to Map[String,String] and nothing else.
        (TypeKind::Object, TypeKind::Map { key, value })
            if matches!(key.kind, TypeKind::String)
                && matches!(value.kind, TypeKind::String) =>
        {
            Coercion::Ok
        }
        // Map[String,_] literal initializing a struct by key.
        (TypeKind::Map { key, value }, TypeKind::StructInstance { members, .. })
            if matches!(key.kind, TypeKind::String) =>
        {
            let mut verdict = Coercion::Ok;
            for (_, mt) in members {
                verdict = verdict.and(coerce(value, mt));
            }
            verdict
        }

        _ => Coercion::Err,
    }
}

/// Quantifier check: a `T?` value may not flow into a `T` slot unless the
/// relaxed policy is selected.
pub fn check_quant(from: &Type, to: &Type, relaxed: bool) -> bool {
    if relaxed || to.optional || !from.optional {
        return true;
    }
    // Any? into T is tolerated — the placeholder has no committed value yet.
    from.is_any()
}

// ---------------------------------------------------------------------------
// Unification — least upper bound for container literals
// ---------------------------------------------------------------------------

/// Least upper bound of a list of types, e.g. for the items of an array
/// literal. Returns `None` when no common supertype exists.
pub fn unify(types: &[Type]) -> Option<Type> {
    let mut it = types.iter();
    let mut acc = it.next()?.clone();
    for t in it {
        acc = unify2(&acc, t)?;
    }
    Some(acc)
}

fn unify2(a: &Type, b: &Type) -> Option<Type> {
    let optional = a.optional || b.optional;
    // Any unifies with anything, preserving the other side's kind and the
    // combined optionality.
    if a.is_any() {
        return Some(b.required().with_optional(optional || b.optional));
    }
    if b.is_any() {
        return Some(a.required().with_optional(optional || a.optional));
    }

    let kind = match (&a.kind, &b.kind) {
        (x, y) if x == y => a.kind.clone(),
        (TypeKind::Int, TypeKind::Float) | (TypeKind::Float, TypeKind::Int) => TypeKind::Float,
        (
            TypeKind::Array {
                item: ai,
                nonempty: ane,
            },
            TypeKind::Array {
                item: bi,
                nonempty: bne,
            },
        ) => TypeKind::Array {
            item: Box::new(unify2(ai, bi)?),
            nonempty: *ane && *bne,
        },
        (TypeKind::Map { key: ak, value: av }, TypeKind::Map { key: bk, value: bv }) => {
            TypeKind::Map {
                key: Box::new(unify2(ak, bk)?),
                value: Box::new(unify2(av, bv)?),
            }
        }
        (
            TypeKind::Pair {
                left: al,
                right: ar,
            },
            TypeKind::Pair {
                left: bl,
                right: br,
            },
        ) => TypeKind::Pair {
            left: Box::new(unify2(al, bl)?),
            right: Box::new(unify2(ar, br)?),
        },
        // One side coercible into the other: the wider side wins. This is
        // what makes `["a", f]` (String + File) a String array.
        _ => {
            if !coerce(b, a).is_err() {
                a.kind.clone()
            } else if !coerce(a, b).is_err() {
                b.kind.clone()
            } else {
                return None;
            }
        }
    };
    Some(Type { kind, optional })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip_shapes() {
        let t = Type::array_nonempty(Type::optional(TypeKind::Int));
        assert_eq!(t.to_string(), "Array[Int?]+");
        let t = Type::map(Type::string(), Type::array(Type::file())).with_optional(true);
        assert_eq!(t.to_string(), "Map[String,Array[File]]?");
    }

    #[test]
    fn identity_and_widening() {
        assert_eq!(coerce(&Type::int(), &Type::int()), Coercion::Ok);
        assert_eq!(coerce(&Type::int(), &Type::float()), Coercion::Ok);
        assert_eq!(
            coerce(&Type::int(), &Type::int().with_optional(true)),
            Coercion::Ok
        );
        assert_eq!(coerce(&Type::float(), &Type::int()), Coercion::Err);
    }

    #[test]
    fn string_coercions_warn() {
        assert_eq!(
            coerce(&Type::int(), &Type::string()),
            Coercion::Warn(CoercionWarning::StringCoercion)
        );
        assert_eq!(
            coerce(&Type::string(), &Type::file()),
            Coercion::Warn(CoercionWarning::FileCoercion)
        );
    }

    #[test]
    fn container_covariance() {
        let from = Type::array(Type::int());
        let to = Type::array(Type::float());
        assert_eq!(coerce(&from, &to), Coercion::Ok);

        let empty = Type::array(Type::any());
        let to_ne = Type::array_nonempty(Type::int());
        assert_eq!(
            coerce(&empty, &to_ne),
            Coercion::Warn(CoercionWarning::EmptyNonempty)
        );

        assert_eq!(
            coerce(&Type::array(Type::file()), &Type::array(Type::int())),
            Coercion::Err
        );
    }

    #[test]
    fn struct_equality_is_member_equality() {
        let a = Type::new(TypeKind::StructInstance {
            name: "A".into(),
            members: vec![("x".into(), Type::int())],
        });
        let b = Type::new(TypeKind::StructInstance {
            name: "B".into(),
            members: vec![("x".into(), Type::int())],
        });
        assert_eq!(coerce(&a, &b), Coercion::Ok);

        let c = Type::new(TypeKind::StructInstance {
            name: "C".into(),
            members: vec![("y".into(), Type::int())],
        });
        assert_eq!(coerce(&a, &c), Coercion::Err);
    }

    #[test]
    fn quant_check_policy() {
        let opt_int = Type::int().with_optional(true);
        assert!(!check_quant(&opt_int, &Type::int(), false));
        assert!(check_quant(&opt_int, &Type::int(), true));
        assert!(check_quant(&opt_int, &opt_int, false));
        assert!(check_quant(&Type::int(), &Type::int(), false));
    }

    #[test]
    fn unify_numeric_and_any() {
        assert_eq!(
            unify(&[Type::int(), Type::float()]),
            Some(Type::float())
        );
        assert_eq!(unify(&[Type::any(), Type::int()]), Some(Type::int()));
        assert_eq!(
            unify(&[Type::int().with_optional(true), Type::int()]),
            Some(Type::int().with_optional(true))
        );
        assert_eq!(unify(&[Type::int(), Type::file()]), None);
    }

    #[test]
    fn unify_string_absorbs_stringables() {
        assert_eq!(
            unify(&[Type::string(), Type::file()]),
            Some(Type::string())
        );
        assert_eq!(
            unify(&[Type::array(Type::string()), Type::array(Type::int())]),
            Some(Type::array(Type::string()))
        );
    }
}
