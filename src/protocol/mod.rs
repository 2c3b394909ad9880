//! Protocol module - Defines the wire protocol for CodePipe communication
//!
//! Every message travels as one frame: a 4-byte big-endian payload length
//! followed by that many bytes of UTF-8 encoded JSON. Raw byte streams
//! (file transfer, custom communicators) run unframed on the same socket
//! after an envelope-level handshake.

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Default address for the pipe server.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// Default port for the pipe server.
pub const DEFAULT_PORT: u16 = 2305;

/// Banner returned by `get_server_banner`.
pub const SERVER_BANNER: &str = "CodePipe Server JSON RPC v2";

/// Reserved error code: server-side fault unrelated to submitted code.
pub const CODE_INTERNAL_ERROR: i64 = -32603;

/// Reserved error code: user-submitted code raised during execution.
pub const CODE_REMOTE_EXEC_ERROR: i64 = -32000;

/// Status byte sent before a bytestream sub-protocol payload: target found.
pub const STATUS_FOUND: u8 = 0x00;

/// Status byte: target not found. The same literal value doubles as the
/// to-server transfer trailer, where it is an opaque end marker, not a
/// status.
pub const STATUS_NOT_FOUND: u8 = 0xff;

/// Chunk size for raw byte streaming.
pub const TRANSFER_CHUNK_SIZE: usize = 4096;

/// Method names routed by the server, requests first, notifications last.
pub mod methods {
    pub const CODE_EXEC: &str = "code_exec";
    pub const FUNC_EXEC: &str = "func_exec";
    pub const OBJECT_PROXY_NEW: &str = "object_proxy_new";
    pub const OBJECT_PROXY_GETATTR: &str = "object_proxy_getattr";
    pub const OBJECT_PROXY_SETATTR: &str = "object_proxy_setattr";
    pub const REGISTER_CUSTOM_COMMUNICATOR: &str = "register_custom_communicator";
    pub const GET_SERVER_BANNER: &str = "get_server_banner";
    pub const REMOTE_SHUTDOWN: &str = "remote_shutdown";

    pub const EXECUTE_CUSTOM_COMMUNICATOR: &str = "execute_custom_communicator";
    pub const FILE_TRANSFER_TO_CLIENT: &str = "file_transfer_to_client";
    pub const FILE_TRANSFER_TO_SERVER: &str = "file_transfer_to_server";
}
