use orion_error::prelude::*;

use rw_lang::types::{Type, TypeKind};

use crate::error::{CoreReason, CoreResult};

// ---------------------------------------------------------------------------
// Value — runtime-tagged values mirroring the type lattice
// ---------------------------------------------------------------------------

/// A runtime WDL value. Every variant knows its own type; absent optionals
/// are `Null` and remember the type they stand in for.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A virtualized file path; the runtime maps it to host or container
    /// paths through a `PathMapper`. Two handles are equal iff their
    /// virtualized paths are.
    File(String),
    Directory(String),
    Array {
        item: Type,
        items: Vec<Value>,
    },
    Map {
        key: Type,
        value: Type,
        entries: Vec<(Value, Value)>,
    },
    Pair(Box<Value>, Box<Value>),
    /// Struct instance, or a legacy `object` literal when `type_name` is
    /// `None`.
    Struct {
        type_name: Option<String>,
        members: Vec<(String, Value)>,
    },
    /// Absent optional, carrying the declared type.
    Null(Type),
}

impl Value {
    pub fn array_of(item: Type, items: Vec<Value>) -> Value {
        Value::Array { item, items }
    }

    pub fn none() -> Value {
        Value::Null(Type::any().with_optional(true))
    }

    /// The runtime type tag of this value.
    pub fn wdl_type(&self) -> Type {
        match self {
            Value::Boolean(_) => Type::boolean(),
            Value::Int(_) => Type::int(),
            Value::Float(_) => Type::float(),
            Value::String(_) => Type::string(),
            Value::File(_) => Type::file(),
            Value::Directory(_) => Type::directory(),
            Value::Array { item, items } => {
                if items.is_empty() {
                    Type::array(item.clone())
                } else {
                    Type::array_nonempty(item.clone())
                }
            }
            Value::Map { key, value, .. } => Type::map(key.clone(), value.clone()),
            Value::Pair(l, r) => Type::pair(l.wdl_type(), r.wdl_type()),
            Value::Struct { type_name, members } => match type_name {
                Some(name) => Type::new(TypeKind::StructInstance {
                    name: name.clone(),
                    members: members.iter().map(|(n, v)| (n.clone(), v.wdl_type())).collect(),
                }),
                None => Type::object(),
            },
            Value::Null(ty) => ty.clone().with_optional(true),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    // -- accessors ----------------------------------------------------

    pub fn as_bool(&self) -> CoreResult<bool> {
        match self {
            Value::Boolean(b) => Ok(*b),
            other => type_err("Boolean", other),
        }
    }

    pub fn as_int(&self) -> CoreResult<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => type_err("Int", other),
        }
    }

    pub fn as_float(&self) -> CoreResult<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => type_err("Float", other),
        }
    }

    pub fn as_str(&self) -> CoreResult<&str> {
        match self {
            Value::String(s) | Value::File(s) | Value::Directory(s) => Ok(s),
            other => type_err("String", other),
        }
    }

    pub fn as_array(&self) -> CoreResult<&[Value]> {
        match self {
            Value::Array { items, .. } => Ok(items),
            other => type_err("Array", other),
        }
    }

    /// Render for interpolation and string coercion.
    pub fn display_string(&self) -> CoreResult<String> {
        match self {
            Value::Boolean(b) => Ok(b.to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(format_float(*f)),
            Value::String(s) | Value::File(s) | Value::Directory(s) => Ok(s.clone()),
            Value::Null(_) => Ok(String::new()),
            other => StructError::from(CoreReason::Eval)
                .with_detail(format!("cannot render {} as a string", other.wdl_type()))
                .err(),
        }
    }

    // -- runtime coercion ---------------------------------------------

    /// Coerce this value into a slot of the given type, materializing the
    /// conversions the static rules permit (numeric widening, string
    /// coercions, container covariance, Object → struct).
    pub fn coerce_to(&self, to: &Type) -> CoreResult<Value> {
        if to.is_any() {
            return Ok(self.clone());
        }
        match (self, &to.kind) {
            (Value::Null(_), _) if to.optional => Ok(Value::Null(to.required())),
            (Value::Null(_), _) => StructError::from(CoreReason::Eval)
                .with_detail(format!("cannot use an absent optional as {to}"))
                .err(),

            (Value::Boolean(_), TypeKind::Boolean)
            | (Value::Int(_), TypeKind::Int)
            | (Value::String(_), TypeKind::String)
            | (Value::File(_), TypeKind::File)
            | (Value::Directory(_), TypeKind::Directory) => Ok(self.clone()),
            (Value::Float(_), TypeKind::Float) => Ok(self.clone()),

            // Numeric widening materializes a new Float.
            (Value::Int(i), TypeKind::Float) => Ok(Value::Float(*i as f64)),

            // Scalars into String slots.
            (
                Value::Int(_) | Value::Float(_) | Value::Boolean(_) | Value::File(_)
                | Value::Directory(_),
                TypeKind::String,
            ) => Ok(Value::String(self.display_string()?)),

            // String into File/Directory slots.
            (Value::String(s), TypeKind::File) => Ok(Value::File(s.clone())),
            (Value::String(s), TypeKind::Directory) => Ok(Value::Directory(s.clone())),

            (Value::Array { items, .. }, TypeKind::Array { item, nonempty }) => {
                if *nonempty && items.is_empty() {
                    return StructError::from(CoreReason::Eval)
                        .with_detail(format!("empty array where {to} is required"))
                        .err();
                }
                let coerced: CoreResult<Vec<Value>> =
                    items.iter().map(|v| v.coerce_to(item)).collect();
                Ok(Value::Array {
                    item: (**item).clone(),
                    items: coerced?,
                })
            }
            (Value::Map { entries, .. }, TypeKind::Map { key, value }) => {
                let coerced: CoreResult<Vec<(Value, Value)>> = entries
                    .iter()
                    .map(|(k, v)| Ok((k.coerce_to(key)?, v.coerce_to(value)?)))
                    .collect();
                Ok(Value::Map {
                    key: (**key).clone(),
                    value: (**value).clone(),
                    entries: coerced?,
                })
            }
            (Value::Pair(l, r), TypeKind::Pair { left, right }) => Ok(Value::Pair(
                Box::new(l.coerce_to(left)?),
                Box::new(r.coerce_to(right)?),
            )),

            // Object/struct/map into a struct slot, by member name.
            (
                Value::Struct { members, .. },
                TypeKind::StructInstance { name, members: decl },
            ) => coerce_members_to_struct(name, decl, |m| {
                members.iter().find(|(n, _)| n == m).map(|(_, v)| v.clone())
            }),
            (
                Value::Map { entries, .. },
                TypeKind::StructInstance { name, members: decl },
            ) => coerce_members_to_struct(name, decl, |m| {
                entries
                    .iter()
                    .find(|(k, _)| matches!(k, Value::String(s) if s == m))
                    .map(|(_, v)| v.clone())
            }),
            // Object degrades to Map[String,String].
            (Value::Struct { members, .. }, TypeKind::Map { key, value })
                if matches!(key.kind, TypeKind::String) =>
            {
                let entries: CoreResult<Vec<(Value, Value)>> = members
                    .iter()
                    .map(|(n, v)| Ok((Value::String(n.clone()), v.coerce_to(value)?)))
                    .collect();
                Ok(Value::Map {
                    key: (**key).clone(),
                    value: (**value).clone(),
                    entries: entries?,
                })
            }

            _ => StructError::from(CoreReason::Eval)
                .with_detail(format!("cannot coerce {} to {to}", self.wdl_type()))
                .err(),
        }
    }

    // -- JSON ----------------------------------------------------------

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) | Value::File(s) | Value::Directory(s) => {
                serde_json::Value::String(s.clone())
            }
            Value::Array { items, .. } => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map { entries, .. } => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    let key = k.display_string().unwrap_or_default();
                    map.insert(key, v.to_json());
                }
                serde_json::Value::Object(map)
            }
            Value::Pair(l, r) => {
                let mut map = serde_json::Map::new();
                map.insert("left".to_string(), l.to_json());
                map.insert("right".to_string(), r.to_json());
                serde_json::Value::Object(map)
            }
            Value::Struct { members, .. } => {
                let mut map = serde_json::Map::new();
                for (n, v) in members {
                    map.insert(n.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
            Value::Null(_) => serde_json::Value::Null,
        }
    }

    /// Decode a JSON value against a declared type. `Any` infers the
    /// natural WDL shape (objects become legacy `Object` values).
    pub fn from_json(json: &serde_json::Value, ty: &Type) -> CoreResult<Value> {
        use serde_json::Value as J;
        match (json, &ty.kind) {
            (J::Null, _) if ty.optional => Ok(Value::Null(ty.required())),
            (J::Null, TypeKind::Any) => Ok(Value::none()),
            (J::Null, _) => StructError::from(CoreReason::Input)
                .with_detail(format!("null where {ty} is required"))
                .err(),

            (J::Bool(b), TypeKind::Boolean | TypeKind::Any) => Ok(Value::Boolean(*b)),
            (J::Number(n), TypeKind::Int) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| {
                    StructError::from(CoreReason::Input)
                        .with_detail(format!("{n} is not an Int"))
                }),
            (J::Number(n), TypeKind::Float) => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| {
                    StructError::from(CoreReason::Input)
                        .with_detail(format!("{n} is not a Float"))
                }),
            (J::Number(n), TypeKind::Any) => Ok(match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            (J::String(s), TypeKind::String) => Ok(Value::String(s.clone())),
            (J::String(s), TypeKind::File) => Ok(Value::File(s.clone())),
            (J::String(s), TypeKind::Directory) => Ok(Value::Directory(s.clone())),
            (J::String(s), TypeKind::Any) => Ok(Value::String(s.clone())),

            (J::Array(items), TypeKind::Array { item, nonempty }) => {
                if *nonempty && items.is_empty() {
                    return StructError::from(CoreReason::Input)
                        .with_detail(format!("empty array where {ty} is required"))
                        .err();
                }
                let decoded: CoreResult<Vec<Value>> =
                    items.iter().map(|j| Value::from_json(j, item)).collect();
                Ok(Value::Array {
                    item: (**item).clone(),
                    items: decoded?,
                })
            }
            (J::Array(items), TypeKind::Any) => {
                let decoded: CoreResult<Vec<Value>> = items
                    .iter()
                    .map(|j| Value::from_json(j, &Type::any()))
                    .collect();
                Ok(Value::Array {
                    item: Type::any(),
                    items: decoded?,
                })
            }

            (J::Object(map), TypeKind::Map { key, value }) => {
                let mut entries = Vec::with_capacity(map.len());
                for (k, v) in map {
                    let kv = Value::String(k.clone()).coerce_to(key)?;
                    entries.push((kv, Value::from_json(v, value)?));
                }
                Ok(Value::Map {
                    key: (**key).clone(),
                    value: (**value).clone(),
                    entries,
                })
            }
            (J::Object(map), TypeKind::StructInstance { name, members }) => {
                coerce_members_to_struct(name, members, |m| {
                    map.get(m)
                        .map(|j| Value::from_json(j, &Type::any()).unwrap_or(Value::none()))
                })
            }
            (J::Object(map), TypeKind::Pair { left, right }) => {
                let l = map.get("left").ok_or_else(|| {
                    StructError::from(CoreReason::Input).with_detail("missing pair member `left`")
                })?;
                let r = map.get("right").ok_or_else(|| {
                    StructError::from(CoreReason::Input).with_detail("missing pair member `right`")
                })?;
                Ok(Value::Pair(
                    Box::new(Value::from_json(l, left)?),
                    Box::new(Value::from_json(r, right)?),
                ))
            }
            (J::Object(map), TypeKind::Any | TypeKind::Object) => {
                let mut members = Vec::with_capacity(map.len());
                for (k, v) in map {
                    members.push((k.clone(), Value::from_json(v, &Type::any())?));
                }
                Ok(Value::Struct {
                    type_name: None,
                    members,
                })
            }

            (j, _) => StructError::from(CoreReason::Input)
                .with_detail(format!("JSON value {j} does not fit {ty}"))
                .err(),
        }
    }
}

fn coerce_members_to_struct(
    name: &str,
    decl: &[(String, Type)],
    mut get: impl FnMut(&str) -> Option<Value>,
) -> CoreResult<Value> {
    let mut members = Vec::with_capacity(decl.len());
    for (member, mty) in decl {
        match get(member) {
            Some(v) => members.push((member.clone(), v.coerce_to(mty)?)),
            None if mty.optional => members.push((member.clone(), Value::Null(mty.required()))),
            None => {
                return StructError::from(CoreReason::Eval)
                    .with_detail(format!("member `{member}` of struct `{name}` is missing"))
                    .err();
            }
        }
    }
    Ok(Value::Struct {
        type_name: Some(name.to_string()),
        members,
    })
}

fn type_err<T>(expected: &str, got: &Value) -> CoreResult<T> {
    StructError::from(CoreReason::Eval)
        .with_detail(format!("expected {expected}, got {}", got.wdl_type()))
        .err()
}

/// WDL float rendering: whole floats keep one decimal place.
pub fn format_float(f: f64) -> String {
    if f.is_finite() && f == f.trunc() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_match_values() {
        assert_eq!(Value::Int(3).wdl_type(), Type::int());
        let arr = Value::array_of(Type::int(), vec![Value::Int(1)]);
        assert_eq!(arr.wdl_type().to_string(), "Array[Int]+");
        let empty = Value::array_of(Type::int(), vec![]);
        assert_eq!(empty.wdl_type().to_string(), "Array[Int]");
    }

    #[test]
    fn numeric_widening_materializes_float() {
        let v = Value::Int(3).coerce_to(&Type::float()).unwrap();
        assert_eq!(v, Value::Float(3.0));
    }

    #[test]
    fn string_file_coercions() {
        let v = Value::String("a.txt".into()).coerce_to(&Type::file()).unwrap();
        assert_eq!(v, Value::File("a.txt".into()));
        let v = Value::Int(7).coerce_to(&Type::string()).unwrap();
        assert_eq!(v, Value::String("7".into()));
    }

    #[test]
    fn null_only_fits_optionals() {
        let null = Value::none();
        assert!(null.coerce_to(&Type::int()).is_err());
        let v = null.coerce_to(&Type::int().with_optional(true)).unwrap();
        assert_eq!(v, Value::Null(Type::int()));
    }

    #[test]
    fn empty_array_rejected_by_nonempty_slot() {
        let empty = Value::array_of(Type::any(), vec![]);
        assert!(empty.coerce_to(&Type::array_nonempty(Type::int())).is_err());
    }

    #[test]
    fn object_initializes_struct() {
        let obj = Value::Struct {
            type_name: None,
            members: vec![("id".into(), Value::String("s1".into()))],
        };
        let ty = Type::new(TypeKind::StructInstance {
            name: "Sample".into(),
            members: vec![("id".into(), Type::string())],
        });
        let v = obj.coerce_to(&ty).unwrap();
        assert!(matches!(v, Value::Struct { type_name: Some(ref n), .. } if n == "Sample"));
    }

    #[test]
    fn json_round_trip_typed() {
        let ty = Type::map(Type::string(), Type::array(Type::int()));
        let json: serde_json::Value = serde_json::from_str(r#"{"a":[1,2],"b":[]}"#).unwrap();
        let v = Value::from_json(&json, &ty).unwrap();
        assert_eq!(v.to_json(), json);
    }

    #[test]
    fn json_null_maps_to_absent_optional() {
        let v = Value::from_json(&serde_json::Value::Null, &Type::int().with_optional(true))
            .unwrap();
        assert!(v.is_null());
        assert!(Value::from_json(&serde_json::Value::Null, &Type::int()).is_err());
    }

    #[test]
    fn float_rendering() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(1.5), "1.5");
        assert_eq!(format_float(0.25), "0.25");
    }
}
