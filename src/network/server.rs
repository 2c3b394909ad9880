//! CodePipe server
//!
//! A strictly sequential accept loop: accept one connection, decode
//! exactly one frame, dispatch it to completion, close, accept again. A
//! second caller is not even accepted until the first is fully served.
//! All execution state lives in one shared context for the server's
//! lifetime; object handles and communicator registrations are never
//! evicted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::{ChannelKind, Communicator, CommunicatorChannel, Connection, ConnectionError, Endpoint};
use crate::executor::{AttrError, ExecContext, ExecFault, Executor, OutputSink, Slot};
use crate::protocol::{
    error_response, live_output, methods, response, Incoming, LiveStream, MessageError,
    CODE_INTERNAL_ERROR, CODE_REMOTE_EXEC_ERROR, SERVER_BANNER, STATUS_FOUND, STATUS_NOT_FOUND,
};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("envelope error: {0}")]
    Envelope(#[from] MessageError),

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Faults raised inside a request handler. For requests these are
/// reported to the caller as internal errors before being logged
/// server-side; for notifications they only reach the log.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("missing or malformed parameter '{0}'")]
    BadParam(&'static str),

    #[error(transparent)]
    Attr(#[from] AttrError),

    #[error("result of kind '{0}' is not JSON serializable")]
    Unserializable(&'static str),

    #[error("'{0}' is not defined in the execution context")]
    MissingSymbol(String),

    #[error("'{0}' is a {1}, not a communicator")]
    NotACommunicator(String, &'static str),

    #[error("server state lock poisoned")]
    StatePoisoned,

    #[error("executor task failed: {0}")]
    ExecutorTask(String),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Everything a dispatched call can touch: the executor, the shared
/// execution namespace, and the communicator routing table.
struct ServerState {
    executor: Box<dyn Executor>,
    ctx: ExecContext,
    communicators: HashMap<String, Arc<dyn Communicator>>,
}

type SharedState = Arc<Mutex<ServerState>>;

/// The pipe server.
pub struct PipeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: SharedState,
}

impl PipeServer {
    /// Bind the listening socket. The executor and context passed here
    /// become the server's single shared execution environment.
    pub async fn bind(
        endpoint: &Endpoint,
        executor: impl Executor,
        ctx: ExecContext,
    ) -> ServerResult<Self> {
        let listener = TcpListener::bind((endpoint.address.as_str(), endpoint.port))
            .await
            .map_err(|err| ServerError::BindFailed(format!("failed to bind {}: {}", endpoint, err)))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(Mutex::new(ServerState {
                executor: Box::new(executor),
                ctx,
                communicators: HashMap::new(),
            })),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until a `remote_shutdown` request arrives.
    pub async fn serve(self) -> ServerResult<()> {
        let ip = self.local_addr.ip().to_string();
        let port = self.local_addr.port();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tracing::info!("pipe server listening on {}", self.local_addr);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    tracing::info!("pipe server stop");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::debug!("connection from {}", addr);
                            let conn = Connection::new(stream);
                            if let Err(err) =
                                dispatch(conn, &self.state, &ip, port, &shutdown_tx).await
                            {
                                tracing::error!("dispatch error: {}", err);
                            }
                        }
                        Err(err) => {
                            tracing::error!("accept error: {}", err);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Serve exactly one connection: one frame in, one handler to
/// completion, connection closed on return.
async fn dispatch(
    mut conn: Connection,
    state: &SharedState,
    ip: &str,
    port: u16,
    shutdown_tx: &mpsc::Sender<()>,
) -> ServerResult<()> {
    let frame = conn.recv_value().await?;

    match Incoming::parse(frame)? {
        Incoming::Request { id, method, params } => {
            let outcome =
                handle_request(&mut conn, state, ip, port, &id, &method, params, shutdown_tx).await;
            if let Err(err) = outcome {
                let mut data = Map::new();
                data.insert(
                    "stacktrace".into(),
                    json!(format!("server handler fault: {}", err)),
                );
                let frame = error_response(&id, CODE_INTERNAL_ERROR, "", ip, port, data);
                let _ = conn.send_value(&frame).await;
                return Err(err.into());
            }
            Ok(())
        }
        Incoming::Notification { method, params } => {
            handle_notification(conn, state, &method, params).await?;
            Ok(())
        }
    }
}

/// Route a request by exact method-name match. An unregistered method is
/// dropped without a response.
#[allow(clippy::too_many_arguments)]
async fn handle_request(
    conn: &mut Connection,
    state: &SharedState,
    ip: &str,
    port: u16,
    id: &str,
    method: &str,
    params: Map<String, Value>,
    shutdown_tx: &mpsc::Sender<()>,
) -> Result<(), HandlerError> {
    match method {
        methods::CODE_EXEC => handle_code_exec(conn, state, ip, port, id, params).await,
        methods::FUNC_EXEC => handle_func_exec(conn, state, ip, port, id, params).await,
        methods::OBJECT_PROXY_NEW => handle_proxy_new(conn, state, ip, port, id, params).await,
        methods::OBJECT_PROXY_GETATTR => handle_proxy_getattr(conn, state, id, params).await,
        methods::OBJECT_PROXY_SETATTR => handle_proxy_setattr(conn, state, id, params).await,
        methods::REGISTER_CUSTOM_COMMUNICATOR => {
            handle_register_communicator(conn, state, ip, port, id, params).await
        }
        methods::GET_SERVER_BANNER => {
            let frame = response(id, Some(json!({ "banner": SERVER_BANNER })));
            conn.send_value(&frame).await?;
            Ok(())
        }
        methods::REMOTE_SHUTDOWN => {
            let _ = shutdown_tx.send(()).await;
            conn.send_value(&response(id, None)).await?;
            Ok(())
        }
        other => {
            tracing::debug!("request for unregistered method '{}' dropped", other);
            Ok(())
        }
    }
}

/// Route a notification. Handler faults propagate to the dispatch loop's
/// log; no error response is ever sent for a notification.
async fn handle_notification(
    conn: Connection,
    state: &SharedState,
    method: &str,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    match method {
        methods::EXECUTE_CUSTOM_COMMUNICATOR => {
            handle_execute_communicator(conn, state, params).await
        }
        methods::FILE_TRANSFER_TO_CLIENT => handle_file_to_client(conn, params).await,
        methods::FILE_TRANSFER_TO_SERVER => handle_file_to_server(conn, params).await,
        other => {
            tracing::debug!("notification for unregistered method '{}' dropped", other);
            Ok(())
        }
    }
}

async fn handle_code_exec(
    conn: &mut Connection,
    state: &SharedState,
    ip: &str,
    port: u16,
    id: &str,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let code = param_str(&params, "code")?;
    let capture = param_flag(&params, "std_cap", false);
    let forward = param_flag(&params, "std_forward", true);

    let source = code.clone();
    let (outcome, captured) = run_on_executor(conn, state, capture, forward, move |ex, ctx, sink| {
        ex.execute(ctx, &source, sink)
    })
    .await?;

    match outcome {
        Ok(()) => {
            let frame = response(id, Some(json!({ "output": captured })));
            conn.send_value(&frame).await?;
        }
        Err(fault) => send_exec_fault(conn, ip, port, id, &fault).await?,
    }
    Ok(())
}

async fn handle_func_exec(
    conn: &mut Connection,
    state: &SharedState,
    ip: &str,
    port: u16,
    id: &str,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let name = param_str(&params, "name")?;
    let args = param_args(&params);
    let kwargs = param_kwargs(&params);
    let forward = param_flag(&params, "std_forward", true);

    let (outcome, _) = run_on_executor(conn, state, false, forward, move |ex, ctx, sink| {
        ex.invoke(ctx, &name, &args, &kwargs, sink)
    })
    .await?;

    match outcome {
        Ok(slot) => {
            let value = match slot {
                None => Value::Null,
                Some(slot) => slot
                    .to_wire()
                    .ok_or_else(|| HandlerError::Unserializable(slot.kind_name()))?,
            };
            let frame = response(id, Some(json!({ "return": value })));
            conn.send_value(&frame).await?;
        }
        Err(fault) => send_exec_fault(conn, ip, port, id, &fault).await?,
    }
    Ok(())
}

async fn handle_proxy_new(
    conn: &mut Connection,
    state: &SharedState,
    ip: &str,
    port: u16,
    id: &str,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let class_name = param_str(&params, "class_name")?;
    let args = param_args(&params);
    let kwargs = param_kwargs(&params);
    let forward = param_flag(&params, "std_forward", true);

    let target = class_name.clone();
    let (outcome, _) = run_on_executor(conn, state, false, forward, move |ex, ctx, sink| {
        ex.invoke(ctx, &target, &args, &kwargs, sink)
    })
    .await?;

    match outcome {
        Ok(slot) => {
            let slot = slot.unwrap_or(Slot::Value(Value::Null));
            let handle = generate_handle(&class_name);
            {
                let mut guard = state.lock().map_err(|_| HandlerError::StatePoisoned)?;
                guard.ctx.insert(&handle, slot);
            }
            let frame = response(id, Some(json!({ "object_name": handle })));
            conn.send_value(&frame).await?;
        }
        Err(fault) => send_exec_fault(conn, ip, port, id, &fault).await?,
    }
    Ok(())
}

async fn handle_proxy_getattr(
    conn: &mut Connection,
    state: &SharedState,
    id: &str,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let object_name = param_str(&params, "object_name")?;
    let name = param_str(&params, "name")?;

    let (value, kind) = {
        let mut guard = state.lock().map_err(|_| HandlerError::StatePoisoned)?;
        let ServerState { executor, ctx, .. } = &mut *guard;
        executor.get_attribute(ctx, &object_name, &name)?
    };

    let frame = response(id, Some(json!({ "type": kind.as_str(), "value": value })));
    conn.send_value(&frame).await?;
    Ok(())
}

async fn handle_proxy_setattr(
    conn: &mut Connection,
    state: &SharedState,
    id: &str,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let object_name = param_str(&params, "object_name")?;
    let name = param_str(&params, "name")?;
    let value = params.get("value").cloned().unwrap_or(Value::Null);

    {
        let mut guard = state.lock().map_err(|_| HandlerError::StatePoisoned)?;
        let ServerState { executor, ctx, .. } = &mut *guard;
        executor.set_attribute(ctx, &object_name, &name, value)?;
    }

    conn.send_value(&response(id, None)).await?;
    Ok(())
}

async fn handle_register_communicator(
    conn: &mut Connection,
    state: &SharedState,
    ip: &str,
    port: u16,
    id: &str,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let name = param_str(&params, "communicator_name")?;
    let code = param_str(&params, "code")?;

    let (outcome, _) = run_on_executor(conn, state, false, false, move |ex, ctx, sink| {
        ex.execute(ctx, &code, sink)
    })
    .await?;

    if let Err(fault) = outcome {
        send_exec_fault(conn, ip, port, id, &fault).await?;
        return Ok(());
    }

    {
        let mut guard = state.lock().map_err(|_| HandlerError::StatePoisoned)?;
        let ServerState {
            ctx, communicators, ..
        } = &mut *guard;
        let handler = match ctx.get(&name) {
            Some(Slot::Communicator(handler)) => handler.clone(),
            Some(other) => {
                return Err(HandlerError::NotACommunicator(name, other.kind_name()))
            }
            None => return Err(HandlerError::MissingSymbol(name)),
        };
        // Last registration for a name wins; entries are never evicted.
        communicators.insert(name, handler);
    }

    conn.send_value(&response(id, None)).await?;
    Ok(())
}

async fn handle_execute_communicator(
    mut conn: Connection,
    state: &SharedState,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let name = param_str(&params, "communicator_name")?;
    let kind = param_str(&params, "com_type")?;

    let handler = {
        let guard = state.lock().map_err(|_| HandlerError::StatePoisoned)?;
        guard.communicators.get(&name).cloned()
    };

    match handler {
        Some(handler) => {
            conn.send_all(&[STATUS_FOUND]).await?;
            if let Ok(kind) = kind.parse::<ChannelKind>() {
                // Ownership of the connection passes to the handler for
                // as long as it cares to keep it.
                handler.run(CommunicatorChannel::wrap(kind, conn)).await;
            }
        }
        None => {
            conn.send_all(&[STATUS_NOT_FOUND]).await?;
        }
    }
    Ok(())
}

async fn handle_file_to_client(
    mut conn: Connection,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let src_file = param_str(&params, "src_file")?;
    let path = Path::new(&src_file);

    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {
            conn.send_all(&[STATUS_FOUND]).await?;
            conn.send_all(&meta.len().to_be_bytes()).await?;
            conn.send_from_file(path).await?;
        }
        _ => {
            conn.send_all(&[STATUS_NOT_FOUND]).await?;
        }
    }
    Ok(())
}

async fn handle_file_to_server(
    mut conn: Connection,
    params: Map<String, Value>,
) -> Result<(), HandlerError> {
    let dst_file = param_str(&params, "dst_file")?;
    let data_len = params
        .get("data_len")
        .and_then(Value::as_u64)
        .ok_or(HandlerError::BadParam("data_len"))?;

    conn.recv_to_file(data_len, Path::new(&dst_file)).await?;
    // End-of-transfer trailer; shares its byte value with the not-found
    // status but carries no status meaning here.
    conn.send_all(&[STATUS_NOT_FOUND]).await?;
    Ok(())
}

/// Run a synchronous executor operation off the async task, relaying
/// live-output chunks onto the connection while it executes. Returns the
/// operation's result and the captured output, with every pending live
/// frame flushed before returning.
async fn run_on_executor<T, F>(
    conn: &mut Connection,
    state: &SharedState,
    capture: bool,
    forward: bool,
    op: F,
) -> Result<(T, Option<String>), HandlerError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn Executor, &mut ExecContext, &mut dyn OutputSink) -> T + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<(LiveStream, String)>();
    let forward_tx = forward.then_some(tx);

    let state = Arc::clone(state);
    let mut task = tokio::task::spawn_blocking(move || -> Result<(T, Option<String>), HandlerError> {
        let mut guard = state.lock().map_err(|_| HandlerError::StatePoisoned)?;
        let ServerState { executor, ctx, .. } = &mut *guard;
        let mut sink = RelaySink::new(capture, forward_tx);
        let value = op(executor.as_mut(), ctx, &mut sink);
        Ok((value, sink.into_captured()))
    });

    let result = loop {
        tokio::select! {
            joined = &mut task => {
                break joined.map_err(|err| HandlerError::ExecutorTask(err.to_string()))??;
            }
            Some((stream, text)) = rx.recv() => {
                conn.send_value(&live_output(stream, &text)).await?;
            }
        }
    };

    // The task finished first in the select above; flush whatever the
    // sink queued after the last relay round.
    while let Ok((stream, text)) = rx.try_recv() {
        conn.send_value(&live_output(stream, &text)).await?;
    }

    Ok(result)
}

async fn send_exec_fault(
    conn: &mut Connection,
    ip: &str,
    port: u16,
    id: &str,
    fault: &ExecFault,
) -> Result<(), HandlerError> {
    let mut data = Map::new();
    data.insert("stacktrace".into(), json!(fault.trace));
    data.insert("code".into(), json!(fault.source));
    let frame = error_response(id, CODE_REMOTE_EXEC_ERROR, "", ip, port, data);
    conn.send_value(&frame).await?;
    Ok(())
}

/// Sink installed for executor-bound calls: each write is captured and/or
/// forwarded independently, falling through to the server's own standard
/// streams when forwarding is off.
struct RelaySink {
    captured: Option<String>,
    forward: Option<mpsc::UnboundedSender<(LiveStream, String)>>,
}

impl RelaySink {
    fn new(capture: bool, forward: Option<mpsc::UnboundedSender<(LiveStream, String)>>) -> Self {
        Self {
            captured: capture.then(String::new),
            forward,
        }
    }

    fn into_captured(self) -> Option<String> {
        self.captured
    }

    fn write(&mut self, stream: LiveStream, text: &str) {
        if let Some(buf) = &mut self.captured {
            buf.push_str(text);
        }
        match &self.forward {
            Some(tx) => {
                let _ = tx.send((stream, text.to_string()));
            }
            None => match stream {
                LiveStream::Stdout => print!("{}", text),
                LiveStream::Stderr => eprint!("{}", text),
            },
        }
    }
}

impl OutputSink for RelaySink {
    fn stdout(&mut self, text: &str) {
        self.write(LiveStream::Stdout, text);
    }

    fn stderr(&mut self, text: &str) {
        self.write(LiveStream::Stderr, text);
    }
}

/// Fresh opaque handle for a newly stored object.
fn generate_handle(class_name: &str) -> String {
    let suffix: [u8; 5] = rand::thread_rng().gen();
    format!("{}_{}", class_name, hex::encode(suffix))
}

fn param_str(params: &Map<String, Value>, name: &'static str) -> Result<String, HandlerError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(HandlerError::BadParam(name))
}

fn param_flag(params: &Map<String, Value>, name: &str, default: bool) -> bool {
    params.get(name).and_then(Value::as_bool).unwrap_or(default)
}

fn param_args(params: &Map<String, Value>) -> Vec<Value> {
    params
        .get("args")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn param_kwargs(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .get("kwargs")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{NativeClass, NativeExecutor};
    use crate::network::{ClientError, OutputRelay, PipeClient};
    use crate::protocol::{bytes_from_wire, wire_bytes, Request};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct CaptureRelay {
        out: StdMutex<String>,
        err: StdMutex<String>,
    }

    impl OutputRelay for CaptureRelay {
        fn stdout(&self, text: &str) {
            self.out.lock().unwrap().push_str(text);
        }
        fn stderr(&self, text: &str) {
            self.err.lock().unwrap().push_str(text);
        }
    }

    /// Echoes fixed-size binary messages back to the peer until it
    /// hangs up.
    struct EchoCommunicator;

    #[async_trait]
    impl Communicator for EchoCommunicator {
        async fn run(&self, channel: CommunicatorChannel) {
            let mut conn = channel.into_connection();
            while let Ok(data) = conn.recv_exact(4).await {
                if conn.send_all(&data).await.is_err() {
                    break;
                }
            }
        }
    }

    fn test_context() -> ExecContext {
        let mut ctx = ExecContext::new();
        ctx.register_function("f", |args, _kwargs, _sink| {
            let x = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(2 + x))
        });
        ctx.register_function("boom", |_args, _kwargs, _sink| {
            Err(ExecFault::new("value error: test exception"))
        });
        ctx.register_function("concat_bytes", |args, _kwargs, _sink| {
            let arg = args.first().ok_or_else(|| ExecFault::new("missing argument"))?;
            let tail = bytes_from_wire(arg)
                .ok_or_else(|| ExecFault::new("argument is not a byte buffer"))?;
            let mut data = vec![0xde, 0xad];
            data.extend_from_slice(&tail);
            Ok(wire_bytes(&data))
        });
        ctx.register_function("shout", |args, _kwargs, sink| {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            sink.stdout(&format!("{}\n", text));
            Ok(Value::Null)
        });
        ctx.register_class(
            NativeClass::new("Counter", |args, _kwargs| {
                let start = args.first().and_then(Value::as_i64).unwrap_or(0);
                let mut fields = Map::new();
                fields.insert("count".into(), json!(start));
                Ok(fields)
            })
            .with_static("UNIT", json!("ticks"))
            .with_method("incr", |fields, args, _kwargs, _sink| {
                let by = args.first().and_then(Value::as_i64).unwrap_or(1);
                let count = fields.get("count").and_then(Value::as_i64).unwrap_or(0) + by;
                fields.insert("count".into(), json!(count));
                Ok(json!(count))
            }),
        );
        ctx.register_communicator("echo", Arc::new(EchoCommunicator));
        ctx
    }

    async fn start_server() -> (Endpoint, JoinHandle<ServerResult<()>>) {
        let server = PipeServer::bind(
            &Endpoint::new("127.0.0.1", 0),
            NativeExecutor::new(),
            test_context(),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        let handle = tokio::spawn(server.serve());
        (Endpoint::new("127.0.0.1", addr.port()), handle)
    }

    async fn shut_down(client: &PipeClient, handle: JoinHandle<ServerResult<()>>) {
        client.remote_shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_banner_then_shutdown_refuses_connections() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint.clone());

        assert_eq!(client.banner().await.unwrap(), SERVER_BANNER);

        shut_down(&client, handle).await;

        // The listening socket is gone with the loop.
        match client.banner().await {
            Err(ClientError::Network(_)) => {}
            other => panic!("expected connection failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_func_exec_returns_result() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint).with_forward(false);

        let result = client
            .func_exec("f", vec![json!(3)], Map::new())
            .await
            .unwrap();
        assert_eq!(result, json!(5));

        shut_down(&client, handle).await;
    }

    #[tokio::test]
    async fn test_func_exec_fault_maps_to_remote_execution_error() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint).with_forward(false);

        match client.func_exec("boom", vec![], Map::new()).await {
            Err(ClientError::RemoteExecution {
                stacktrace, code, ..
            }) => {
                assert!(stacktrace.contains("value error: test exception"));
                assert!(code.contains("boom("));
            }
            other => panic!("expected RemoteExecution, got {:?}", other),
        }

        // Undefined names fault the same way.
        match client.func_exec("not_exist", vec![], Map::new()).await {
            Err(ClientError::RemoteExecution { stacktrace, .. }) => {
                assert!(stacktrace.contains("name 'not_exist' is not defined"));
            }
            other => panic!("expected RemoteExecution, got {:?}", other),
        }

        shut_down(&client, handle).await;
    }

    #[tokio::test]
    async fn test_byte_buffers_roundtrip_through_envelope() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint).with_forward(false);

        let result = client
            .func_exec("concat_bytes", vec![wire_bytes(&[0xbe])], Map::new())
            .await
            .unwrap();
        assert_eq!(bytes_from_wire(&result).unwrap(), vec![0xde, 0xad, 0xbe]);

        shut_down(&client, handle).await;
    }

    #[tokio::test]
    async fn test_live_output_forwarding_and_capture() {
        let (endpoint, handle) = start_server().await;
        let relay = Arc::new(CaptureRelay::default());
        let client = PipeClient::new(endpoint.clone()).with_relay(relay.clone());

        client.exec("print(\"Aa\")").await.unwrap();
        assert_eq!(*relay.out.lock().unwrap(), "Aa\n");

        client.exec("eprint(\"Bb\")").await.unwrap();
        assert_eq!(*relay.err.lock().unwrap(), "Bb\n");

        // Forwarding also happens for function calls writing output.
        client
            .func_exec("shout", vec![json!("Cc")], Map::new())
            .await
            .unwrap();
        assert_eq!(*relay.out.lock().unwrap(), "Aa\nCc\n");

        // Captured output comes back in the response instead.
        let captured = client.exec_capture("print(\"Dd\")").await.unwrap();
        assert_eq!(captured, "Dd\n");

        // With forwarding off, nothing reaches this relay.
        let quiet_relay = Arc::new(CaptureRelay::default());
        let quiet = PipeClient::new(endpoint)
            .with_relay(quiet_relay.clone())
            .with_forward(false);
        quiet.exec("print(\"Ee\")").await.unwrap();
        assert_eq!(*quiet_relay.out.lock().unwrap(), "");

        shut_down(&client, handle).await;
    }

    #[tokio::test]
    async fn test_shared_namespace_across_calls() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint).with_forward(false);

        client.exec("ccc = 45").await.unwrap();
        let output = client.exec_capture("print(ccc)").await.unwrap();
        assert_eq!(output, "45\n");

        shut_down(&client, handle).await;
    }

    #[tokio::test]
    async fn test_object_proxy_lifecycle() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint).with_forward(false);

        let counter = client.class_proxy("Counter", None);
        let first = counter.new_instance(vec![json!(10)], Map::new()).await.unwrap();
        let second = counter.new_instance(vec![json!(0)], Map::new()).await.unwrap();

        assert!(first.handle.starts_with("Counter_"));
        assert_ne!(first.handle, second.handle);

        // Attribute read, method call, attribute write.
        assert_eq!(first.get("count").await.unwrap().into_value().unwrap(), json!(10));
        assert_eq!(
            first.call("incr", vec![json!(5)], Map::new()).await.unwrap(),
            json!(15)
        );

        let mut first = first;
        first.set("count", json!(40)).await.unwrap();
        assert_eq!(first.get("count").await.unwrap().into_value().unwrap(), json!(40));

        // Handles never interfere.
        assert_eq!(second.get("count").await.unwrap().into_value().unwrap(), json!(0));

        // Callable attributes come back as stubs.
        let incr = first.get("incr").await.unwrap().into_callable().unwrap();
        assert_eq!(incr.call(vec![json!(2)], Map::new()).await.unwrap(), json!(42));

        // Class-level state via the class proxy.
        let mut counter = counter;
        assert_eq!(
            counter.get("UNIT").await.unwrap().into_value().unwrap(),
            json!("ticks")
        );
        counter.set("UNIT", json!("steps")).await.unwrap();
        assert_eq!(
            counter.get("UNIT").await.unwrap().into_value().unwrap(),
            json!("steps")
        );

        // Missing attributes are server faults, not execution faults.
        match first.get("missing").await {
            Err(ClientError::Internal { stacktrace }) => {
                assert!(stacktrace.contains("has no attribute"));
            }
            other => panic!("expected Internal, got {:?}", other),
        }

        shut_down(&client, handle).await;
    }

    #[tokio::test]
    async fn test_unknown_request_method_is_dropped() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint.clone());

        let request = Request::new("no_such_method", Map::new());
        let mut conn = Connection::connect(&endpoint.address, endpoint.port)
            .await
            .unwrap();
        conn.send_value(&request.to_value()).await.unwrap();

        // No response, no error: the server just closes the connection.
        match conn.recv_value().await {
            Err(ConnectionError::Closed) => {}
            other => panic!("expected silent close, got {:?}", other),
        }

        shut_down(&client, handle).await;
    }

    #[tokio::test]
    async fn test_file_transfer_roundtrips() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint).with_forward(false);

        let dir = tempfile::tempdir().unwrap();

        // Below and above the 4096-byte chunk size.
        for len in [10usize, 4096 * 10 + 123] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let remote = dir
                .path()
                .join(format!("remote-{}.bin", len))
                .to_string_lossy()
                .into_owned();

            client.push_bytes(&payload, &remote).await.unwrap();
            let fetched = client.fetch_bytes(&remote).await.unwrap();
            assert_eq!(fetched.len(), len);
            assert_eq!(fetched, payload);

            let local = dir.path().join(format!("local-{}.bin", len));
            let count = client.fetch_file(&remote, &local).await.unwrap();
            assert_eq!(count, len as u64);
            assert_eq!(std::fs::read(&local).unwrap(), payload);
        }

        // Pushing a local file works the same as pushing bytes.
        let src = dir.path().join("push-src.bin");
        std::fs::write(&src, b"pipe me over").unwrap();
        let remote = dir.path().join("push-dst.bin").to_string_lossy().into_owned();
        client.push_file(&src, &remote).await.unwrap();
        assert_eq!(client.fetch_bytes(&remote).await.unwrap(), b"pipe me over");

        // Missing files surface as FileNotFound.
        let ghost = dir.path().join("ghost.bin").to_string_lossy().into_owned();
        match client.fetch_bytes(&ghost).await {
            Err(ClientError::FileNotFound(path)) => assert_eq!(path, ghost),
            other => panic!("expected FileNotFound, got {:?}", other),
        }

        shut_down(&client, handle).await;
    }

    #[tokio::test]
    async fn test_communicator_negotiation_and_handoff() {
        let (endpoint, handle) = start_server().await;
        let client = PipeClient::new(endpoint).with_forward(false);

        client.register_custom_communicator("echo", "").await.unwrap();

        let channel = client
            .execute_custom_communicator("echo", "binary")
            .await
            .unwrap();
        let mut conn = channel.into_connection();
        conn.send_all(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(conn.recv_exact(4).await.unwrap(), vec![1, 2, 3, 4]);
        // A second exchange proves the handler kept the connection.
        conn.send_all(&[9, 8, 7, 6]).await.unwrap();
        assert_eq!(conn.recv_exact(4).await.unwrap(), vec![9, 8, 7, 6]);
        drop(conn);

        // Unknown names answer with the not-found status, without blocking.
        match client.execute_custom_communicator("ghost", "binary").await {
            Err(ClientError::CommunicatorNotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected CommunicatorNotFound, got {:?}", other),
        }

        // Registering a name that resolves to no communicator symbol is a
        // server fault.
        match client.register_custom_communicator("f", "").await {
            Err(ClientError::Internal { stacktrace }) => {
                assert!(stacktrace.contains("not a communicator"));
            }
            other => panic!("expected Internal, got {:?}", other),
        }

        shut_down(&client, handle).await;
    }
}
