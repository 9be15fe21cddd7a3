//! Named functions an engine can run.
//!
//! Functions never travel as code. A client sends a [`FunctionRef`] and the
//! engine looks the name up here. Both sides must register the same names.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::object::{FunctionRef, Object};
use super::CanningError;

/// An engine's persistent variables.
pub type Namespace = BTreeMap<String, Object>;

/// Signature every registered function has.
pub type NativeFunction = Arc<
    dyn Fn(&mut Namespace, Vec<Object>, BTreeMap<String, Object>) -> Result<Object, FunctionError>
        + Send
        + Sync,
>;

/// Module name of the builtin namespace helpers.
pub const BUILTIN_MODULE: &str = "parallax";

/// An exception raised by a registered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionError {
    pub ename: String,
    pub evalue: String,
}

impl FunctionError {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
        }
    }

    pub fn type_error(evalue: impl Into<String>) -> Self {
        Self::new("TypeError", evalue)
    }

    pub fn value_error(evalue: impl Into<String>) -> Self {
        Self::new("ValueError", evalue)
    }

    pub fn key_error(evalue: impl Into<String>) -> Self {
        Self::new("KeyError", evalue)
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.ename, self.evalue)
    }
}

impl std::error::Error for FunctionError {}

#[derive(Clone)]
struct Registered {
    arity: Option<usize>,
    func: NativeFunction,
}

/// Table of functions callable by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Registered>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the builtin `parallax.push` and `parallax.pull`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(BUILTIN_MODULE, "push", Some(1), builtin_push);
        registry.register(BUILTIN_MODULE, "pull", Some(1), builtin_pull);
        registry.register(BUILTIN_MODULE, "keys", Some(0), |ns, _, _| {
            Ok(Object::List(ns.keys().cloned().map(Object::Str).collect()))
        });
        registry
    }

    /// Registers `f` as `module.name`.
    ///
    /// With `arity` set, calls are checked against it and missing trailing
    /// arguments are filled from the reference's defaults. `None` accepts any
    /// positional arguments.
    pub fn register<F>(&mut self, module: &str, name: &str, arity: Option<usize>, f: F)
    where
        F: Fn(&mut Namespace, Vec<Object>, BTreeMap<String, Object>) -> Result<Object, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(
            format!("{}.{}", module, name),
            Registered {
                arity,
                func: Arc::new(f),
            },
        );
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.functions.contains_key(&format!("{}.{}", module, name))
    }

    /// Resolves a reference to something callable.
    ///
    /// Registered names win. Otherwise `namespace[name]` may hold a function
    /// reference that is registered, which is then called with `fref`'s
    /// defaults.
    pub fn bind(&self, fref: &FunctionRef, namespace: &Namespace) -> Result<Callable, CanningError> {
        let registered = self.functions.get(&fref.qualified_name()).or_else(|| {
            match namespace.get(&fref.name) {
                Some(Object::Function(alias)) => self.functions.get(&alias.qualified_name()),
                _ => None,
            }
        });

        match registered {
            Some(r) => Ok(Callable {
                name: fref.qualified_name(),
                arity: r.arity,
                defaults: fref.defaults.clone(),
                func: r.func.clone(),
            }),
            None => Err(CanningError::UnknownFunction(fref.qualified_name())),
        }
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

/// A resolved function with its defaults.
#[derive(Clone)]
pub struct Callable {
    name: String,
    arity: Option<usize>,
    defaults: Vec<Object>,
    func: NativeFunction,
}

impl Callable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(
        &self,
        namespace: &mut Namespace,
        mut args: Vec<Object>,
        kwargs: BTreeMap<String, Object>,
    ) -> Result<Object, FunctionError> {
        if let Some(arity) = self.arity {
            if args.len() > arity {
                return Err(FunctionError::type_error(format!(
                    "{}() takes {} positional arguments but {} were given",
                    self.name,
                    arity,
                    args.len()
                )));
            }
            let missing = arity - args.len();
            if missing > self.defaults.len() {
                return Err(FunctionError::type_error(format!(
                    "{}() missing {} required positional argument(s)",
                    self.name,
                    missing - self.defaults.len()
                )));
            }
            // Defaults cover the last parameters.
            let skip = self.defaults.len() - missing;
            args.extend(self.defaults[skip..].iter().cloned());
        }
        (self.func)(namespace, args, kwargs)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// `push(ns_updates)`: merges a dict into the namespace.
fn builtin_push(
    ns: &mut Namespace,
    args: Vec<Object>,
    _kwargs: BTreeMap<String, Object>,
) -> Result<Object, FunctionError> {
    match args.into_iter().next() {
        Some(Object::Dict(updates)) => {
            ns.extend(updates);
            Ok(Object::None)
        }
        Some(other) => Err(FunctionError::type_error(format!(
            "push expects a dict, got {}",
            other.type_name()
        ))),
        None => Err(FunctionError::type_error("push expects a dict")),
    }
}

/// `pull(name_or_names)`: reads one name, or a list of names, from the namespace.
fn builtin_pull(
    ns: &mut Namespace,
    args: Vec<Object>,
    _kwargs: BTreeMap<String, Object>,
) -> Result<Object, FunctionError> {
    let lookup = |name: &str| {
        ns.get(name)
            .cloned()
            .ok_or_else(|| FunctionError::key_error(format!("'{}'", name)))
    };

    match args.first() {
        Some(Object::Str(name)) => lookup(name),
        Some(Object::List(names)) | Some(Object::Tuple(names)) => {
            let mut values = Vec::with_capacity(names.len());
            for name in names {
                match name {
                    Object::Str(name) => values.push(lookup(name)?),
                    other => {
                        return Err(FunctionError::type_error(format!(
                            "names must be str, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Object::List(values))
        }
        Some(other) => Err(FunctionError::type_error(format!(
            "pull expects a name or list of names, got {}",
            other.type_name()
        ))),
        None => Err(FunctionError::type_error("pull expects a name")),
    }
}
