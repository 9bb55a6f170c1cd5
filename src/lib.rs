//! napi-bridge - engine-neutral reference and handle-scope lifetimes
//!
//! An embedding layer that gives native addons one lifetime model over
//! engines with very different memory management: a protect-counter engine,
//! a refcounted engine, and a tracing engine with a walkable root list.
//! References outlive any single native call; handle scopes bound the
//! lifetime of everything created inside them; a pending-exception state
//! machine gates engine operations until the embedder collects the error.
//!
//! # Example
//! ```ignore
//! use napi_bridge::{Backend, Value, Vm};
//!
//! let vm = Vm::new(Backend::RefCount);
//! let mut env = vm.create_env();
//! let scope = env.open_handle_scope()?;
//! let obj = env.create_object()?;
//! let id = env.create_reference(obj, 1)?; // strong, survives the scope
//! env.close_handle_scope(scope)?;
//! ```

// Core lifetime machinery
pub mod reference;
pub mod scope;

// Engine backends behind one adapter trait
pub mod engine;

// Environment, status codes, values
pub mod env;
pub mod status;
pub mod value;
pub mod vm;

// Re-export main types
pub use env::{Env, EnvStats};
pub use reference::RefId;
pub use scope::ScopeId;
pub use status::{ExtendedErrorInfo, Status};
pub use value::Value;
pub use vm::{Backend, Vm};
