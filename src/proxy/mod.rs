//! Caller-side proxies for server-resident objects
//!
//! Instance, class, and function proxies share one capability set against
//! a handle: attribute read, attribute write, method call. They are plain
//! local stubs built by factory methods on `PipeClient` and own no server
//! state beyond the handle string.
//!
//! A small reserved set of bookkeeping field names (`handle`, `address`,
//! `class_name`, `source`, `forward`) is resolved purely locally and
//! never sent to the server.

use serde_json::{json, Map, Value};

use crate::network::{ClientError, ClientResult, PipeClient};
use crate::executor::AttrKind;

/// Bookkeeping field names resolved locally by every proxy.
pub const RESERVED_FIELDS: [&str; 5] = ["handle", "address", "class_name", "source", "forward"];

/// A resolved attribute: either a plain value or a remote call stub.
#[derive(Debug)]
pub enum Attr {
    Value(Value),
    Callable(CallStub),
}

impl Attr {
    /// The attribute value, for callers that expect plain data.
    pub fn into_value(self) -> ClientResult<Value> {
        match self {
            Attr::Value(value) => Ok(value),
            Attr::Callable(stub) => Err(ClientError::Protocol(format!(
                "attribute '{}' is callable, not a value",
                stub.target()
            ))),
        }
    }

    /// The call stub, for callers that expect a method.
    pub fn into_callable(self) -> ClientResult<CallStub> {
        match self {
            Attr::Callable(stub) => Ok(stub),
            Attr::Value(value) => Err(ClientError::Protocol(format!(
                "attribute is a plain value, not callable: {}",
                value
            ))),
        }
    }
}

/// A stub performing a remote call keyed `"<target>.<name>"`.
#[derive(Debug, Clone)]
pub struct CallStub {
    client: PipeClient,
    target: String,
}

impl CallStub {
    fn new(client: PipeClient, target: String) -> Self {
        Self { client, target }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> ClientResult<Value> {
        self.client.func_exec(&self.target, args, kwargs).await
    }
}

/// Proxy over one live server-resident instance.
#[derive(Debug, Clone)]
pub struct InstanceProxy {
    client: PipeClient,
    pub handle: String,
    pub address: String,
    pub class_name: Option<String>,
    pub source: Option<String>,
    pub forward: bool,
}

impl InstanceProxy {
    pub(crate) fn new(
        client: PipeClient,
        handle: &str,
        class_name: Option<&str>,
        source: Option<&str>,
    ) -> Self {
        Self {
            handle: handle.to_string(),
            address: client.endpoint().to_string(),
            class_name: class_name.map(str::to_string),
            source: source.map(str::to_string),
            forward: client.forward(),
            client,
        }
    }

    /// Read an attribute. Callables come back as call stubs; the
    /// display-only remote description is never consumed.
    pub async fn get(&self, name: &str) -> ClientResult<Attr> {
        if let Some(local) = self.local_field(name) {
            return Ok(Attr::Value(local));
        }
        let (value, kind) = self.client.object_proxy_getattr(&self.handle, name).await?;
        Ok(match kind {
            AttrKind::Callable => Attr::Callable(CallStub::new(
                self.client.clone().with_forward(self.forward),
                format!("{}.{}", self.handle, name),
            )),
            AttrKind::Value => Attr::Value(value),
        })
    }

    /// Write an attribute. Reserved bookkeeping names update the local
    /// stub only.
    pub async fn set(&mut self, name: &str, value: Value) -> ClientResult<()> {
        if RESERVED_FIELDS.contains(&name) {
            return self.set_local_field(name, value);
        }
        self.client
            .object_proxy_setattr(&self.handle, name, value)
            .await
    }

    /// Call a method on the remote instance.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> ClientResult<Value> {
        self.client
            .clone()
            .with_forward(self.forward)
            .func_exec(&format!("{}.{}", self.handle, name), args, kwargs)
            .await
    }

    fn local_field(&self, name: &str) -> Option<Value> {
        match name {
            "handle" => Some(json!(self.handle)),
            "address" => Some(json!(self.address)),
            "class_name" => Some(json!(self.class_name)),
            "source" => Some(json!(self.source)),
            "forward" => Some(json!(self.forward)),
            _ => None,
        }
    }

    fn set_local_field(&mut self, name: &str, value: Value) -> ClientResult<()> {
        match (name, value) {
            ("handle", Value::String(handle)) => self.handle = handle,
            ("address", Value::String(address)) => self.address = address,
            ("class_name", Value::String(class_name)) => self.class_name = Some(class_name),
            ("class_name", Value::Null) => self.class_name = None,
            ("source", Value::String(source)) => self.source = Some(source),
            ("source", Value::Null) => self.source = None,
            ("forward", Value::Bool(forward)) => self.forward = forward,
            (name, value) => {
                return Err(ClientError::Protocol(format!(
                    "reserved field '{}' cannot hold {}",
                    name, value
                )))
            }
        }
        Ok(())
    }
}

/// Proxy over a registered class: class-level attribute access plus
/// remote instantiation, no pre-existing instance required.
#[derive(Debug, Clone)]
pub struct ClassProxy {
    client: PipeClient,
    pub class_name: String,
    pub address: String,
    pub source: Option<String>,
    pub forward: bool,
}

impl ClassProxy {
    pub(crate) fn new(client: PipeClient, class_name: &str, source: Option<&str>) -> Self {
        Self {
            class_name: class_name.to_string(),
            address: client.endpoint().to_string(),
            source: source.map(str::to_string),
            forward: client.forward(),
            client,
        }
    }

    /// Construct a remote instance and wrap it in a proxy.
    pub async fn new_instance(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> ClientResult<InstanceProxy> {
        let handle = self
            .client
            .clone()
            .with_forward(self.forward)
            .object_proxy_new(&self.class_name, args, kwargs)
            .await?;
        Ok(InstanceProxy::new(
            self.client.clone(),
            &handle,
            Some(&self.class_name),
            self.source.as_deref(),
        ))
    }

    /// Read a class-level attribute.
    pub async fn get(&self, name: &str) -> ClientResult<Attr> {
        if let Some(local) = self.local_field(name) {
            return Ok(Attr::Value(local));
        }
        let (value, kind) = self
            .client
            .object_proxy_getattr(&self.class_name, name)
            .await?;
        Ok(match kind {
            AttrKind::Callable => Attr::Callable(CallStub::new(
                self.client.clone().with_forward(self.forward),
                format!("{}.{}", self.class_name, name),
            )),
            AttrKind::Value => Attr::Value(value),
        })
    }

    /// Write a class-level attribute.
    pub async fn set(&mut self, name: &str, value: Value) -> ClientResult<()> {
        if RESERVED_FIELDS.contains(&name) {
            return self.set_local_field(name, value);
        }
        self.client
            .object_proxy_setattr(&self.class_name, name, value)
            .await
    }

    /// Call a class-level method.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> ClientResult<Value> {
        self.client
            .clone()
            .with_forward(self.forward)
            .func_exec(&format!("{}.{}", self.class_name, name), args, kwargs)
            .await
    }

    fn local_field(&self, name: &str) -> Option<Value> {
        match name {
            "handle" | "class_name" => Some(json!(self.class_name)),
            "address" => Some(json!(self.address)),
            "source" => Some(json!(self.source)),
            "forward" => Some(json!(self.forward)),
            _ => None,
        }
    }

    fn set_local_field(&mut self, name: &str, value: Value) -> ClientResult<()> {
        match (name, value) {
            ("handle" | "class_name", Value::String(class_name)) => self.class_name = class_name,
            ("address", Value::String(address)) => self.address = address,
            ("source", Value::String(source)) => self.source = Some(source),
            ("source", Value::Null) => self.source = None,
            ("forward", Value::Bool(forward)) => self.forward = forward,
            (name, value) => {
                return Err(ClientError::Protocol(format!(
                    "reserved field '{}' cannot hold {}",
                    name, value
                )))
            }
        }
        Ok(())
    }
}

/// Call stub for a registered free function.
#[derive(Debug, Clone)]
pub struct FuncProxy {
    client: PipeClient,
    pub name: String,
    pub source: Option<String>,
}

impl FuncProxy {
    pub(crate) fn new(client: PipeClient, name: &str, source: Option<&str>) -> Self {
        Self {
            client,
            name: name.to_string(),
            source: source.map(str::to_string),
        }
    }

    pub async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> ClientResult<Value> {
        self.client.func_exec(&self.name, args, kwargs).await
    }
}
