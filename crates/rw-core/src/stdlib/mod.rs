use std::path::{Path, PathBuf};
use std::sync::Arc;

use orion_error::prelude::*;

use rw_lang::types::{Type, TypeKind};

use crate::error::{CoreReason, CoreResult};
use crate::value::Value;

mod io;

// ---------------------------------------------------------------------------
// PathMapper — virtualized path resolution capability
// ---------------------------------------------------------------------------

/// Maps the opaque path handles inside `File`/`Directory` values to host
/// paths (for stdlib I/O) and back (when synthesizing new files).
pub trait PathMapper: Send + Sync + std::fmt::Debug {
    fn to_host(&self, virt: &str) -> CoreResult<PathBuf>;
    fn virtualize(&self, host: &Path) -> String;
}

/// The trivial mapper: handles are host paths.
#[derive(Debug, Default)]
pub struct IdentityMapper;

impl PathMapper for IdentityMapper {
    fn to_host(&self, virt: &str) -> CoreResult<PathBuf> {
        Ok(PathBuf::from(virt))
    }

    fn virtualize(&self, host: &Path) -> String {
        host.to_string_lossy().into_owned()
    }
}

/// Post-execution I/O context available to task output expressions.
#[derive(Debug, Clone)]
pub struct TaskIo {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub work_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Stdlib — the function registry
// ---------------------------------------------------------------------------

/// The standard-library function registry: static and polymorphic pure
/// functions, plus filesystem functions routed through the `PathMapper`
/// and a per-run `write_/` directory.
#[derive(Debug, Clone)]
pub struct Stdlib {
    write_dir: Option<PathBuf>,
    mapper: Arc<dyn PathMapper>,
    task_io: Option<TaskIo>,
}

impl Stdlib {
    pub fn new(write_dir: PathBuf, mapper: Arc<dyn PathMapper>) -> Self {
        Stdlib {
            write_dir: Some(write_dir),
            mapper,
            task_io: None,
        }
    }

    /// A registry with no filesystem access; `read_*`/`write_*` fail.
    /// Used for input-stage evaluation and tests.
    pub fn pure_only() -> Self {
        Stdlib {
            write_dir: None,
            mapper: Arc::new(IdentityMapper),
            task_io: None,
        }
    }

    /// Extend with the post-execution task context (`stdout()`,
    /// `stderr()`, `glob()`).
    pub fn with_task_io(mut self, io: TaskIo) -> Self {
        self.task_io = Some(io);
        self
    }

    /// Swap the path mapper (e.g. to resolve relative handles against a
    /// task work directory).
    pub fn with_mapper(mut self, mapper: Arc<dyn PathMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn mapper(&self) -> &Arc<dyn PathMapper> {
        &self.mapper
    }

    /// Apply a standard-library function to evaluated arguments.
    pub fn call(&self, name: &str, args: Vec<Value>) -> CoreResult<Value> {
        match name {
            // -- numeric ------------------------------------------------
            "floor" => Ok(Value::Int(one_float(name, &args)?.floor() as i64)),
            "ceil" => Ok(Value::Int(one_float(name, &args)?.ceil() as i64)),
            "round" => Ok(Value::Int(one_float(name, &args)?.round() as i64)),
            "min" => min_max(name, args, false),
            "max" => min_max(name, args, true),

            // -- containers ---------------------------------------------
            "length" => {
                let [v] = take::<1>(name, args)?;
                Ok(Value::Int(v.as_array()?.len() as i64))
            }
            "range" => {
                let [v] = take::<1>(name, args)?;
                let n = v.as_int()?;
                if n < 0 {
                    return eval_err(format!("range({n}): negative length"));
                }
                Ok(Value::array_of(
                    Type::int(),
                    (0..n).map(Value::Int).collect(),
                ))
            }
            "flatten" => {
                let [v] = take::<1>(name, args)?;
                let mut out = Vec::new();
                let mut item = Type::any();
                for inner in v.as_array()? {
                    if let Value::Array { item: it, items } = inner {
                        item = it.clone();
                        out.extend(items.iter().cloned());
                    } else {
                        return eval_err("flatten() expects Array[Array[X]]");
                    }
                }
                Ok(Value::array_of(item, out))
            }
            "transpose" => transpose(name, args),
            "zip" => zip_cross(name, args, false),
            "cross" => zip_cross(name, args, true),
            "keys" => {
                let [v] = take::<1>(name, args)?;
                match v {
                    Value::Map { key, entries, .. } => Ok(Value::array_of(
                        key,
                        entries.into_iter().map(|(k, _)| k).collect(),
                    )),
                    other => eval_err(format!("keys() expects a Map, got {}", other.wdl_type())),
                }
            }

            // -- optionals ----------------------------------------------
            "defined" => {
                let [v] = take::<1>(name, args)?;
                Ok(Value::Boolean(!v.is_null()))
            }
            "select_first" => {
                let [v] = take::<1>(name, args)?;
                v.as_array()?
                    .iter()
                    .find(|x| !x.is_null())
                    .cloned()
                    .ok_or_else(|| {
                        StructError::from(CoreReason::Eval)
                            .with_detail("select_first(): no value present")
                    })
            }
            "select_all" => {
                let [v] = take::<1>(name, args)?;
                let items: Vec<Value> = v
                    .as_array()?
                    .iter()
                    .filter(|x| !x.is_null())
                    .cloned()
                    .collect();
                let item = match v.wdl_type().kind {
                    TypeKind::Array { item, .. } => item.required(),
                    _ => Type::any(),
                };
                Ok(Value::array_of(item, items))
            }

            // -- strings ------------------------------------------------
            "sub" => {
                let [input, pattern, replacement] = take::<3>(name, args)?;
                let re = regex::Regex::new(input_str(&pattern)?).map_err(|e| {
                    StructError::from(CoreReason::Eval)
                        .with_detail(format!("sub(): invalid pattern: {e}"))
                })?;
                Ok(Value::String(
                    re.replace_all(input_str(&input)?, input_str(&replacement)?)
                        .into_owned(),
                ))
            }
            "basename" => {
                let mut args = args;
                let suffix = if args.len() == 2 {
                    Some(args.pop().unwrap())
                } else {
                    None
                };
                let [v] = take::<1>(name, args)?;
                let path = v.display_string()?;
                let mut base = path
                    .rsplit('/')
                    .next()
                    .unwrap_or(path.as_str())
                    .to_string();
                if let Some(sfx) = suffix {
                    if let Some(stripped) = base.strip_suffix(input_str(&sfx)?) {
                        base = stripped.to_string();
                    }
                }
                Ok(Value::String(base))
            }
            "sep" => {
                let [sep, arr] = take::<2>(name, args)?;
                let parts: CoreResult<Vec<String>> =
                    arr.as_array()?.iter().map(Value::display_string).collect();
                Ok(Value::String(parts?.join(input_str(&sep)?)))
            }
            "prefix" => affix(name, args, true),
            "suffix" => affix(name, args, false),
            "quote" => quoted(name, args, '"'),
            "squote" => quoted(name, args, '\''),

            // -- filesystem ---------------------------------------------
            "size" => io::size(self, name, args),
            "stdout" => self.task_file(name, |io| io.stdout.clone()),
            "stderr" => self.task_file(name, |io| io.stderr.clone()),
            "glob" => io::glob_files(self, name, args),
            "read_string" => io::read_string(self, args),
            "read_int" => io::read_scalar(self, args, "read_int"),
            "read_float" => io::read_scalar(self, args, "read_float"),
            "read_boolean" => io::read_scalar(self, args, "read_boolean"),
            "read_lines" => io::read_lines(self, args),
            "read_tsv" => io::read_tsv(self, args),
            "read_map" => io::read_map(self, args),
            "read_json" => io::read_json(self, args),
            "read_object" => io::read_json(self, args),
            "write_lines" => io::write_lines(self, args),
            "write_tsv" => io::write_tsv(self, args),
            "write_map" => io::write_map(self, args),
            "write_json" => io::write_json(self, args),

            _ => StructError::from(CoreReason::Eval)
                .with_detail(format!("no function named `{name}`"))
                .err(),
        }
    }

    fn task_file(&self, name: &str, f: impl Fn(&TaskIo) -> PathBuf) -> CoreResult<Value> {
        match &self.task_io {
            Some(io) => Ok(Value::File(self.mapper.virtualize(&f(io)))),
            None => eval_err(format!("{name}() is only available in task output sections")),
        }
    }

    pub(crate) fn write_dir(&self) -> CoreResult<&Path> {
        self.write_dir.as_deref().ok_or_else(|| {
            StructError::from(CoreReason::Filesystem)
                .with_detail("no write directory in this evaluation context")
        })
    }

    pub(crate) fn task_io(&self) -> Option<&TaskIo> {
        self.task_io.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

pub(crate) fn eval_err<T>(msg: impl Into<String>) -> CoreResult<T> {
    StructError::from(CoreReason::Eval).with_detail(msg.into()).err()
}

pub(crate) fn take<const N: usize>(name: &str, args: Vec<Value>) -> CoreResult<[Value; N]> {
    let got = args.len();
    args.try_into()
        .map_err(|_| {
            StructError::from(CoreReason::Eval)
                .with_detail(format!("{name}() takes {N} arguments, got {got}"))
        })
}

fn one_float(name: &str, args: &[Value]) -> CoreResult<f64> {
    match args {
        [v] => v.as_float(),
        _ => eval_err(format!("{name}() takes 1 argument, got {}", args.len())),
    }
}

fn input_str(v: &Value) -> CoreResult<&str> {
    v.as_str()
}

fn min_max(name: &str, args: Vec<Value>, want_max: bool) -> CoreResult<Value> {
    let [a, b] = take::<2>(name, args)?;
    if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
        let out = if want_max { *x.max(y) } else { *x.min(y) };
        return Ok(Value::Int(out));
    }
    let (x, y) = (a.as_float()?, b.as_float()?);
    let out = if want_max { x.max(y) } else { x.min(y) };
    Ok(Value::Float(out))
}

fn transpose(name: &str, args: Vec<Value>) -> CoreResult<Value> {
    let [v] = take::<1>(name, args)?;
    let rows = v.as_array()?;
    if rows.is_empty() {
        return Ok(Value::array_of(Type::array(Type::any()), Vec::new()));
    }
    let mut matrix: Vec<&[Value]> = Vec::with_capacity(rows.len());
    for row in rows {
        matrix.push(row.as_array()?);
    }
    let width = matrix[0].len();
    if matrix.iter().any(|r| r.len() != width) {
        return eval_err("transpose() requires a rectangular array");
    }
    let item = match v.wdl_type().kind {
        TypeKind::Array { item, .. } => (*item).clone(),
        _ => Type::array(Type::any()),
    };
    let mut out = Vec::with_capacity(width);
    for col in 0..width {
        let column: Vec<Value> = matrix.iter().map(|r| r[col].clone()).collect();
        out.push(Value::Array {
            item: match &item.kind {
                TypeKind::Array { item, .. } => (**item).clone(),
                _ => Type::any(),
            },
            items: column,
        });
    }
    Ok(Value::array_of(item, out))
}

fn zip_cross(name: &str, args: Vec<Value>, cross: bool) -> CoreResult<Value> {
    let [a, b] = take::<2>(name, args)?;
    let (xs, ys) = (a.as_array()?, b.as_array()?);
    let item = Type::pair(
        item_type(&a).unwrap_or_else(Type::any),
        item_type(&b).unwrap_or_else(Type::any),
    );
    let mut out = Vec::new();
    if cross {
        for x in xs {
            for y in ys {
                out.push(Value::Pair(Box::new(x.clone()), Box::new(y.clone())));
            }
        }
    } else {
        if xs.len() != ys.len() {
            return eval_err(format!(
                "zip(): arrays differ in length ({} vs {})",
                xs.len(),
                ys.len()
            ));
        }
        for (x, y) in xs.iter().zip(ys.iter()) {
            out.push(Value::Pair(Box::new(x.clone()), Box::new(y.clone())));
        }
    }
    Ok(Value::array_of(item, out))
}

fn item_type(v: &Value) -> Option<Type> {
    match v.wdl_type().kind {
        TypeKind::Array { item, .. } => Some(*item),
        _ => None,
    }
}

fn affix(name: &str, args: Vec<Value>, prepend: bool) -> CoreResult<Value> {
    let [affix, arr] = take::<2>(name, args)?;
    let affix = input_str(&affix)?;
    let out: CoreResult<Vec<Value>> = arr
        .as_array()?
        .iter()
        .map(|v| {
            let s = v.display_string()?;
            Ok(Value::String(if prepend {
                format!("{affix}{s}")
            } else {
                format!("{s}{affix}")
            }))
        })
        .collect();
    Ok(Value::array_of(Type::string(), out?))
}

fn quoted(name: &str, args: Vec<Value>, q: char) -> CoreResult<Value> {
    let [arr] = take::<1>(name, args)?;
    let out: CoreResult<Vec<Value>> = arr
        .as_array()?
        .iter()
        .map(|v| Ok(Value::String(format!("{q}{}{q}", v.display_string()?))))
        .collect();
    Ok(Value::array_of(Type::string(), out?))
}
