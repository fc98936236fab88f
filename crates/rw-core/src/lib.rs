pub mod env;
pub mod error;
pub mod eval;
pub mod json;
pub mod stdlib;
pub mod value;

pub use env::{Binding, Env};
pub use error::{CoreError, CoreReason, CoreResult};
pub use eval::{eval, eval_placeholder, interpolate_command};
pub use stdlib::{IdentityMapper, PathMapper, Stdlib, TaskIo};
pub use value::Value;
