//! CodePipe client
//!
//! Every outbound call opens a fresh connection, sends one request, and
//! loops on that connection until the terminal response arrives,
//! relaying any interleaved live-output frames as they show up. There
//! are no timeouts: a silent peer blocks the caller indefinitely, and
//! connections are never reused across calls.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::{ChannelKind, CommunicatorChannel, Connection, ConnectionError, Endpoint, UnsupportedChannelKind};
use crate::executor::AttrKind;
use crate::protocol::{
    methods, to_wire, CodecError, LiveStream, MessageError, Notification, Reply, Request,
    CODE_INTERNAL_ERROR, CODE_REMOTE_EXEC_ERROR, STATUS_FOUND,
};
use crate::proxy::{ClassProxy, FuncProxy, InstanceProxy};

/// Client errors - the closed taxonomy every caller sees.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("network failure: {0}")]
    Network(std::io::Error),

    #[error("protocol failure: {0}")]
    Protocol(String),

    #[error("server internal error: {stacktrace}")]
    Internal { stacktrace: String },

    #[error("remote code execution failed: {stacktrace}")]
    RemoteExecution {
        stacktrace: String,
        /// The exact source text that was executed.
        code: String,
        ip: String,
        port: u16,
    },

    #[error("file '{0}' not found on server")]
    FileNotFound(String),

    #[error("custom communicator '{0}' not found")]
    CommunicatorNotFound(String),

    #[error("unsupported channel kind '{0}'")]
    UnsupportedChannel(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl From<ConnectionError> for ClientError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Io(err) => ClientError::Network(err),
            ConnectionError::Closed => ClientError::Network(broken_pipe()),
            ConnectionError::Codec(codec) => match codec {
                CodecError::Io(err) => ClientError::Network(err),
                CodecError::ConnectionClosed => ClientError::Network(broken_pipe()),
                other => ClientError::Protocol(other.to_string()),
            },
        }
    }
}

impl From<MessageError> for ClientError {
    fn from(err: MessageError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

impl From<UnsupportedChannelKind> for ClientError {
    fn from(err: UnsupportedChannelKind) -> Self {
        ClientError::UnsupportedChannel(err.0)
    }
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "socket connection broken")
}

/// Sinks for live-output frames relayed during a pending call.
pub trait OutputRelay: Send + Sync {
    fn stdout(&self, text: &str);
    fn stderr(&self, text: &str);
}

/// Default relay: the caller's own standard streams.
pub struct StdioRelay;

impl OutputRelay for StdioRelay {
    fn stdout(&self, text: &str) {
        use std::io::Write;
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }

    fn stderr(&self, text: &str) {
        use std::io::Write;
        eprint!("{}", text);
        let _ = std::io::stderr().flush();
    }
}

/// Convert caller-side values into wire arguments, failing locally (before
/// any network I/O) on values with no JSON representation.
pub fn wire_args<T: Serialize>(items: &[T]) -> ClientResult<Vec<Value>> {
    items.iter().map(|item| Ok(to_wire(item)?)).collect()
}

/// The raw call transport: request/response and notification sending.
#[derive(Clone)]
pub struct RpcClient {
    endpoint: Endpoint,
    relay: Arc<dyn OutputRelay>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl RpcClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            relay: Arc::new(StdioRelay),
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn OutputRelay>) -> Self {
        self.relay = relay;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send a request and block until its terminal response arrives,
    /// forwarding interleaved live-output frames to the relay.
    pub async fn call(&self, method: &str, params: Map<String, Value>) -> ClientResult<Value> {
        let request = Request::new(method, params);
        let mut conn = Connection::connect(&self.endpoint.address, self.endpoint.port).await?;
        conn.send_value(&request.to_value()).await?;

        loop {
            let frame = conn.recv_value().await?;
            match Reply::classify(frame, &request.id) {
                Reply::Result(value) => return Ok(value),
                Reply::Error { code, data, .. } => match map_rpc_error(code, data) {
                    Some(err) => return Err(err),
                    // An unreserved error code resolves to a void result.
                    None => return Ok(Value::Null),
                },
                Reply::Void => return Ok(Value::Null),
                Reply::Live(LiveStream::Stdout, text) => self.relay.stdout(&text),
                Reply::Live(LiveStream::Stderr, text) => self.relay.stderr(&text),
                Reply::Unrelated => {}
            }
        }
    }

    /// Send a notification and hand back the open connection for a
    /// caller-driven sub-protocol.
    pub async fn notify(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> ClientResult<Connection> {
        let notification = Notification::new(method, params);
        let mut conn = Connection::connect(&self.endpoint.address, self.endpoint.port).await?;
        conn.send_value(&notification.to_value()).await?;
        Ok(conn)
    }
}

fn map_rpc_error(code: i64, data: Map<String, Value>) -> Option<ClientError> {
    let field = |name: &str| {
        data.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    match code {
        CODE_INTERNAL_ERROR => Some(ClientError::Internal {
            stacktrace: field("stacktrace"),
        }),
        CODE_REMOTE_EXEC_ERROR => Some(ClientError::RemoteExecution {
            stacktrace: field("stacktrace"),
            code: field("code"),
            ip: field("ip"),
            port: data.get("port").and_then(Value::as_u64).unwrap_or(0) as u16,
        }),
        _ => None,
    }
}

/// The typed client surface over the pipe protocol.
#[derive(Clone)]
pub struct PipeClient {
    rpc: RpcClient,
    /// Whether remote calls forward their output back to this caller.
    forward: bool,
}

impl fmt::Debug for PipeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeClient")
            .field("endpoint", self.rpc.endpoint())
            .field("forward", &self.forward)
            .finish()
    }
}

impl PipeClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            rpc: RpcClient::new(endpoint),
            forward: true,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn OutputRelay>) -> Self {
        self.rpc = self.rpc.with_relay(relay);
        self
    }

    pub fn with_forward(mut self, forward: bool) -> Self {
        self.forward = forward;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.rpc.endpoint()
    }

    pub fn forward(&self) -> bool {
        self.forward
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Fetch the server banner.
    pub async fn banner(&self) -> ClientResult<String> {
        let result = self.rpc.call(methods::GET_SERVER_BANNER, Map::new()).await?;
        result["banner"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol("banner missing from response".into()))
    }

    /// Ask the server to stop accepting connections and exit its loop.
    pub async fn remote_shutdown(&self) -> ClientResult<()> {
        self.rpc.call(methods::REMOTE_SHUTDOWN, Map::new()).await?;
        Ok(())
    }

    /// Execute source text remotely; output is forwarded per the client's
    /// forward flag and not captured.
    pub async fn exec(&self, code: &str) -> ClientResult<()> {
        self.exec_inner(code, false).await?;
        Ok(())
    }

    /// Execute source text remotely and return the captured output.
    pub async fn exec_capture(&self, code: &str) -> ClientResult<String> {
        let output = self.exec_inner(code, true).await?;
        Ok(output.unwrap_or_default())
    }

    async fn exec_inner(&self, code: &str, capture: bool) -> ClientResult<Option<String>> {
        let mut params = Map::new();
        params.insert("code".into(), json!(code));
        params.insert("std_cap".into(), json!(capture));
        params.insert("std_forward".into(), json!(self.forward));
        let result = self.rpc.call(methods::CODE_EXEC, params).await?;
        Ok(result["output"].as_str().map(str::to_string))
    }

    /// Call a named function, class constructor, or `handle.method`.
    pub async fn func_exec(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> ClientResult<Value> {
        let mut params = Map::new();
        params.insert("name".into(), json!(name));
        params.insert("args".into(), Value::Array(args));
        params.insert("kwargs".into(), Value::Object(kwargs));
        params.insert("std_forward".into(), json!(self.forward));
        let mut result = self.rpc.call(methods::FUNC_EXEC, params).await?;
        Ok(result
            .as_object_mut()
            .and_then(|obj| obj.remove("return"))
            .unwrap_or(Value::Null))
    }

    /// Instantiate a registered class remotely; returns the new handle.
    pub async fn object_proxy_new(
        &self,
        class_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> ClientResult<String> {
        let mut params = Map::new();
        params.insert("class_name".into(), json!(class_name));
        params.insert("args".into(), Value::Array(args));
        params.insert("kwargs".into(), Value::Object(kwargs));
        params.insert("std_forward".into(), json!(self.forward));
        let result = self.rpc.call(methods::OBJECT_PROXY_NEW, params).await?;
        result["object_name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol("object_name missing from response".into()))
    }

    /// Resolve an attribute on a server-resident object or class.
    pub async fn object_proxy_getattr(
        &self,
        object_name: &str,
        name: &str,
    ) -> ClientResult<(Value, AttrKind)> {
        let mut params = Map::new();
        params.insert("object_name".into(), json!(object_name));
        params.insert("name".into(), json!(name));
        let mut result = self.rpc.call(methods::OBJECT_PROXY_GETATTR, params).await?;
        let kind = AttrKind::from_wire(result["type"].as_str().unwrap_or_default());
        let value = result
            .as_object_mut()
            .and_then(|obj| obj.remove("value"))
            .unwrap_or(Value::Null);
        Ok((value, kind))
    }

    /// Assign an attribute on a server-resident object or class.
    pub async fn object_proxy_setattr(
        &self,
        object_name: &str,
        name: &str,
        value: Value,
    ) -> ClientResult<()> {
        let mut params = Map::new();
        params.insert("object_name".into(), json!(object_name));
        params.insert("name".into(), json!(name));
        params.insert("value".into(), value);
        self.rpc.call(methods::OBJECT_PROXY_SETATTR, params).await?;
        Ok(())
    }

    /// Register a custom communicator handler by name and source.
    pub async fn register_custom_communicator(
        &self,
        communicator_name: &str,
        code: &str,
    ) -> ClientResult<()> {
        let mut params = Map::new();
        params.insert("communicator_name".into(), json!(communicator_name));
        params.insert("code".into(), json!(code));
        self.rpc
            .call(methods::REGISTER_CUSTOM_COMMUNICATOR, params)
            .await?;
        Ok(())
    }

    /// Negotiate a custom-communicator channel. The kind is validated
    /// locally before any I/O; on success the returned channel is the
    /// caller's to drive.
    pub async fn execute_custom_communicator(
        &self,
        communicator_name: &str,
        kind: &str,
    ) -> ClientResult<CommunicatorChannel> {
        let kind = ChannelKind::from_str(kind)?;

        let mut params = Map::new();
        params.insert("communicator_name".into(), json!(communicator_name));
        params.insert("com_type".into(), json!(kind.as_str()));
        let mut conn = self
            .rpc
            .notify(methods::EXECUTE_CUSTOM_COMMUNICATOR, params)
            .await?;

        if conn.recv_status().await? == STATUS_FOUND {
            Ok(CommunicatorChannel::wrap(kind, conn))
        } else {
            Err(ClientError::CommunicatorNotFound(
                communicator_name.to_string(),
            ))
        }
    }

    /// Fetch a remote file into memory.
    pub async fn fetch_bytes(&self, src_file: &str) -> ClientResult<Vec<u8>> {
        let (mut conn, len) = self.start_fetch(src_file).await?;
        Ok(conn.recv_exact(len as usize).await?)
    }

    /// Fetch a remote file into a local file. Returns the byte count.
    pub async fn fetch_file(&self, src_file: &str, dst_file: &Path) -> ClientResult<u64> {
        let (mut conn, len) = self.start_fetch(src_file).await?;
        Ok(conn.recv_to_file(len, dst_file).await?)
    }

    async fn start_fetch(&self, src_file: &str) -> ClientResult<(Connection, u64)> {
        let mut params = Map::new();
        params.insert("src_file".into(), json!(src_file));
        let mut conn = self
            .rpc
            .notify(methods::FILE_TRANSFER_TO_CLIENT, params)
            .await?;

        if conn.recv_status().await? != STATUS_FOUND {
            return Err(ClientError::FileNotFound(src_file.to_string()));
        }
        let bytes = conn.recv_exact(8).await?;
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&bytes);
        Ok((conn, u64::from_be_bytes(prefix)))
    }

    /// Push an in-memory buffer to a remote file.
    pub async fn push_bytes(&self, data: &[u8], dst_file: &str) -> ClientResult<()> {
        let mut conn = self.start_push(dst_file, data.len() as u64).await?;
        conn.send_all(data).await?;
        // Trailer byte: an opaque end marker, not a status.
        conn.recv_status().await?;
        Ok(())
    }

    /// Push a local file to a remote file.
    pub async fn push_file(&self, src_file: &Path, dst_file: &str) -> ClientResult<()> {
        let len = tokio::fs::metadata(src_file)
            .await
            .map_err(ClientError::Network)?
            .len();
        let mut conn = self.start_push(dst_file, len).await?;
        conn.send_from_file(src_file).await?;
        conn.recv_status().await?;
        Ok(())
    }

    async fn start_push(&self, dst_file: &str, data_len: u64) -> ClientResult<Connection> {
        let mut params = Map::new();
        params.insert("dst_file".into(), json!(dst_file));
        params.insert("data_len".into(), json!(data_len));
        Ok(self
            .rpc
            .notify(methods::FILE_TRANSFER_TO_SERVER, params)
            .await?)
    }

    /// Build a proxy for an existing server-resident object.
    pub fn instance_proxy(&self, handle: &str, class_name: Option<&str>) -> InstanceProxy {
        InstanceProxy::new(self.clone(), handle, class_name, None)
    }

    /// Build a proxy for a registered class.
    pub fn class_proxy(&self, class_name: &str, source: Option<&str>) -> ClassProxy {
        ClassProxy::new(self.clone(), class_name, source)
    }

    /// Build a call stub for a registered function.
    pub fn func_proxy(&self, name: &str, source: Option<&str>) -> FuncProxy {
        FuncProxy::new(self.clone(), name, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{error_response, response};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct CaptureRelay {
        out: Mutex<String>,
        err: Mutex<String>,
    }

    impl OutputRelay for CaptureRelay {
        fn stdout(&self, text: &str) {
            self.out.lock().unwrap().push_str(text);
        }
        fn stderr(&self, text: &str) {
            self.err.lock().unwrap().push_str(text);
        }
    }

    /// A scripted peer: accepts one connection, reads the request, and
    /// replies with the frames produced by `script`.
    async fn scripted_peer<F>(script: F) -> Endpoint
    where
        F: FnOnce(String) -> Vec<Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let request = conn.recv_value().await.unwrap();
            let id = request["id"].as_str().unwrap().to_string();
            for frame in script(id) {
                conn.send_value(&frame).await.unwrap();
            }
        });
        Endpoint::new("127.0.0.1", addr.port())
    }

    #[tokio::test]
    async fn test_call_relays_live_output_before_result() {
        let endpoint = scripted_peer(|id| {
            vec![
                json!({"live_stdout": "working...\n"}),
                json!({"live_stderr": "warn\n"}),
                response(&id, Some(json!({"output": null}))),
            ]
        })
        .await;

        let relay = Arc::new(CaptureRelay::default());
        let client = RpcClient::new(endpoint).with_relay(relay.clone());

        let result = client.call("code_exec", Map::new()).await.unwrap();
        assert_eq!(result["output"], Value::Null);
        assert_eq!(*relay.out.lock().unwrap(), "working...\n");
        assert_eq!(*relay.err.lock().unwrap(), "warn\n");
    }

    #[tokio::test]
    async fn test_call_maps_reserved_error_codes() {
        let endpoint = scripted_peer(|id| {
            let mut data = Map::new();
            data.insert("stacktrace".into(), json!("trace text"));
            data.insert("code".into(), json!("boom()"));
            vec![error_response(
                &id,
                CODE_REMOTE_EXEC_ERROR,
                "",
                "127.0.0.1",
                2305,
                data,
            )]
        })
        .await;

        let client = RpcClient::new(endpoint);
        match client.call("func_exec", Map::new()).await {
            Err(ClientError::RemoteExecution {
                stacktrace,
                code,
                ip,
                port,
            }) => {
                assert_eq!(stacktrace, "trace text");
                assert_eq!(code, "boom()");
                assert_eq!(ip, "127.0.0.1");
                assert_eq!(port, 2305);
            }
            other => panic!("expected RemoteExecution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_unreserved_error_code_is_void() {
        let endpoint =
            scripted_peer(|id| vec![error_response(&id, -32601, "", "127.0.0.1", 2305, Map::new())])
                .await;

        let client = RpcClient::new(endpoint);
        let result = client.call("anything", Map::new()).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_call_skips_frames_for_other_ids() {
        let endpoint = scripted_peer(|id| {
            vec![
                response("someone-else", Some(json!(1))),
                response(&id, Some(json!({"banner": "ok"}))),
            ]
        })
        .await;

        let client = RpcClient::new(endpoint);
        let result = client.call("get_server_banner", Map::new()).await.unwrap();
        assert_eq!(result["banner"], "ok");
    }

    #[tokio::test]
    async fn test_unsupported_channel_kind_fails_before_io() {
        // No server is listening anywhere near this endpoint; the call
        // must fail on the kind check alone.
        let client = PipeClient::new(Endpoint::new("203.0.113.1", 9));
        match client.execute_custom_communicator("echo", "msgpack").await {
            Err(ClientError::UnsupportedChannel(kind)) => assert_eq!(kind, "msgpack"),
            other => panic!("expected UnsupportedChannel, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wire_args_boundary_error_is_local() {
        let bad: std::collections::HashMap<(u8, u8), i32> =
            std::collections::HashMap::from([((1, 2), 3)]);
        match wire_args(&[bad]) {
            Err(ClientError::Protocol(_)) => {}
            other => panic!("expected local protocol error, got {:?}", other),
        }
    }
}
