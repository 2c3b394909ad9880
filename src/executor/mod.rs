//! Executor contract and execution context
//!
//! The server core drives code execution through the four-operation
//! [`Executor`] contract and never depends on how source text is parsed
//! or compiled. All state lives in an [`ExecContext`]: a single symbol
//! table shared by every call on a server, passed into the executor by
//! mutable reference. There is no per-call isolation.

mod native;

pub use native::NativeExecutor;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::network::Communicator;

/// A fault raised by executed code, carrying the full textual trace and
/// the exact source text that failed.
#[derive(Debug, Clone)]
pub struct ExecFault {
    pub message: String,
    pub trace: String,
    pub source: String,
}

impl ExecFault {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            trace: message.clone(),
            message,
            source: String::new(),
        }
    }

    /// Attach the statement that was executing when the fault occurred.
    pub fn at_statement(mut self, statement: &str) -> Self {
        self.trace = format!("execution fault: {}\n  statement: {}", self.message, statement);
        self
    }

    /// Attach the full source text submitted for execution.
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }
}

impl fmt::Display for ExecFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExecFault {}

/// Attribute access errors; these are server faults, not execution faults.
#[derive(Error, Debug)]
pub enum AttrError {
    #[error("unknown object handle '{0}'")]
    UnknownHandle(String),

    #[error("object '{0}' has no attribute '{1}'")]
    NoSuchAttribute(String, String),

    #[error("attribute '{1}' of '{0}' cannot be assigned")]
    NotAssignable(String, String),
}

/// Classification of a resolved attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Value,
    Callable,
}

impl AttrKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttrKind::Value => "value",
            AttrKind::Callable => "callable",
        }
    }

    pub fn from_wire(kind: &str) -> Self {
        if kind == "callable" {
            AttrKind::Callable
        } else {
            AttrKind::Value
        }
    }
}

/// Receives each stdout/stderr write as it happens during execution.
pub trait OutputSink: Send {
    fn stdout(&mut self, text: &str);
    fn stderr(&mut self, text: &str);
}

/// A native function callable from executed code.
pub type NativeFn = Arc<
    dyn Fn(&[Value], &Map<String, Value>, &mut dyn OutputSink) -> Result<Value, ExecFault>
        + Send
        + Sync,
>;

/// A method bound to mutable state (instance fields or class statics).
pub type BoundFn = Arc<
    dyn Fn(
            &mut Map<String, Value>,
            &[Value],
            &Map<String, Value>,
            &mut dyn OutputSink,
        ) -> Result<Value, ExecFault>
        + Send
        + Sync,
>;

/// A constructor producing the initial field table of a new instance.
pub type CtorFn =
    Arc<dyn Fn(&[Value], &Map<String, Value>) -> Result<Map<String, Value>, ExecFault> + Send + Sync>;

/// A native class: constructor, class-level state, and method tables.
#[derive(Clone)]
pub struct NativeClass {
    pub name: String,
    ctor: CtorFn,
    pub statics: Map<String, Value>,
    class_methods: HashMap<String, BoundFn>,
    instance_methods: HashMap<String, BoundFn>,
}

impl NativeClass {
    pub fn new<F>(name: &str, ctor: F) -> Self
    where
        F: Fn(&[Value], &Map<String, Value>) -> Result<Map<String, Value>, ExecFault>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            ctor: Arc::new(ctor),
            statics: Map::new(),
            class_methods: HashMap::new(),
            instance_methods: HashMap::new(),
        }
    }

    pub fn with_static(mut self, name: &str, value: Value) -> Self {
        self.statics.insert(name.to_string(), value);
        self
    }

    pub fn with_class_method<F>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(
                &mut Map<String, Value>,
                &[Value],
                &Map<String, Value>,
                &mut dyn OutputSink,
            ) -> Result<Value, ExecFault>
            + Send
            + Sync
            + 'static,
    {
        self.class_methods.insert(name.to_string(), Arc::new(method));
        self
    }

    pub fn with_method<F>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(
                &mut Map<String, Value>,
                &[Value],
                &Map<String, Value>,
                &mut dyn OutputSink,
            ) -> Result<Value, ExecFault>
            + Send
            + Sync
            + 'static,
    {
        self.instance_methods.insert(name.to_string(), Arc::new(method));
        self
    }

    pub fn class_method(&self, name: &str) -> Option<BoundFn> {
        self.class_methods.get(name).cloned()
    }

    pub fn has_class_method(&self, name: &str) -> bool {
        self.class_methods.contains_key(name)
    }

    /// Construct a new live instance of this class.
    pub fn instantiate(
        &self,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<NativeInstance, ExecFault> {
        let fields = (self.ctor)(args, kwargs)?;
        Ok(NativeInstance {
            class_name: self.name.clone(),
            fields,
            methods: self.instance_methods.clone(),
        })
    }
}

/// A live server-resident object produced by instantiation.
#[derive(Clone)]
pub struct NativeInstance {
    pub class_name: String,
    pub fields: Map<String, Value>,
    methods: HashMap<String, BoundFn>,
}

impl NativeInstance {
    pub fn method(&self, name: &str) -> Option<BoundFn> {
        self.methods.get(name).cloned()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }
}

/// One entry of the shared symbol table.
#[derive(Clone)]
pub enum Slot {
    Value(Value),
    Function(NativeFn),
    Class(NativeClass),
    Instance(NativeInstance),
    Communicator(Arc<dyn Communicator>),
}

impl Slot {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Slot::Value(_) => "value",
            Slot::Function(_) => "function",
            Slot::Class(_) => "class",
            Slot::Instance(_) => "instance",
            Slot::Communicator(_) => "communicator",
        }
    }

    /// The wire representation of this slot, if it has one.
    pub fn to_wire(&self) -> Option<Value> {
        match self {
            Slot::Value(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Value(value) => write!(f, "Value({})", value),
            Slot::Function(_) => write!(f, "Function"),
            Slot::Class(class) => write!(f, "Class({})", class.name),
            Slot::Instance(inst) => write!(f, "Instance({})", inst.class_name),
            Slot::Communicator(_) => write!(f, "Communicator"),
        }
    }
}

/// The shared execution namespace: one symbol table per server, mutated
/// by every call, never isolated, never evicted.
#[derive(Default)]
pub struct ExecContext {
    symbols: HashMap<String, Slot>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Slot> {
        self.symbols.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Slot> {
        self.symbols.get_mut(name)
    }

    pub fn insert(&mut self, name: &str, slot: Slot) {
        self.symbols.insert(name.to_string(), slot);
    }

    pub fn remove(&mut self, name: &str) -> Option<Slot> {
        self.symbols.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Bind a plain value into the namespace.
    pub fn bind(&mut self, name: &str, value: Value) {
        self.insert(name, Slot::Value(value));
    }

    /// Register a native function callable from executed code.
    pub fn register_function<F>(&mut self, name: &str, body: F)
    where
        F: Fn(&[Value], &Map<String, Value>, &mut dyn OutputSink) -> Result<Value, ExecFault>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, Slot::Function(Arc::new(body)));
    }

    /// Register a native class under its own name.
    pub fn register_class(&mut self, class: NativeClass) {
        let name = class.name.clone();
        self.insert(&name, Slot::Class(class));
    }

    /// Register a communicator handler symbol; the server copies it into
    /// its routing table when the registration RPC names it.
    pub fn register_communicator(&mut self, name: &str, handler: Arc<dyn Communicator>) {
        self.insert(name, Slot::Communicator(handler));
    }
}

/// The four-operation collaborator contract the core depends on.
///
/// Execution and invocation faults map to remote-execution errors on the
/// wire; attribute faults map to server-internal errors.
pub trait Executor: Send + 'static {
    /// Run source text against the shared namespace, streaming each
    /// stdout/stderr write into `sink` as it happens.
    fn execute(
        &mut self,
        ctx: &mut ExecContext,
        source: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<(), ExecFault>;

    /// Call a named function, class constructor, or `target.method`,
    /// returning the produced result slot (absent when the call produced
    /// none). Temporary argument bindings never outlive the call.
    fn invoke(
        &mut self,
        ctx: &mut ExecContext,
        target: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        sink: &mut dyn OutputSink,
    ) -> Result<Option<Slot>, ExecFault>;

    /// Resolve a named attribute on a stored object or class.
    fn get_attribute(
        &mut self,
        ctx: &mut ExecContext,
        target: &str,
        name: &str,
    ) -> Result<(Value, AttrKind), AttrError>;

    /// Assign a named attribute on a stored object or class.
    fn set_attribute(
        &mut self,
        ctx: &mut ExecContext,
        target: &str,
        name: &str,
        value: Value,
    ) -> Result<(), AttrError>;
}
