// Minimal request/response transport used by every component.
//
// A caller opens a fresh TCP connection per call, writes one request line
// and reads a single value until the callee closes the connection.

use std::{io, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub mod client;
pub mod request;
pub mod server;
pub mod value;

pub use client::RpcClient;
pub use request::Request;
pub use server::RpcServer;
pub use value::WireValue;

// Generic reply sent when a handler fails unexpectedly
pub const SERVER_ERROR: &str = "Server error";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty request")]
    EmptyRequest,
    #[error("Invalid method name \"{0}\"")]
    InvalidMethod(String),
    #[error("Argument \"{arg}\" of method {method} can't be sent on the wire")]
    InvalidArgument { method: String, arg: String },
    #[error("Method {method} is missing argument {name}")]
    MissingArgument { method: String, name: String },
    #[error("Method {method}: invalid {name} \"{value}\": {reason}")]
    BadArgument {
        method: String,
        name: String,
        value: String,
        reason: String,
    },
}

// Errors raised on the calling side of the transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Gave up connecting to {addr} after {attempts} refused attempts")]
    Unreachable { addr: String, attempts: u32 },
    #[error("I/O error while calling {method} on {addr}")]
    Io {
        addr: String,
        method: String,
        #[source]
        source: io::Error,
    },
    #[error("Call to {method} on {addr} timed out after {timeout:?}")]
    Timeout {
        addr: String,
        method: String,
        timeout: Duration,
    },
}

// Errors a service handler can return. Protocol errors are reported
// back to the caller as text, anything else becomes SERVER_ERROR
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

// Number of positional arguments a method accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: usize,
}

impl Arity {
    pub const fn exact(count: usize) -> Self {
        Self {
            min: count,
            max: count,
        }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn accepts(&self, count: usize) -> bool {
        (self.min..=self.max).contains(&count)
    }

    // Text sent back when a call has the wrong number of arguments
    pub fn mismatch_message(&self, method: &str) -> String {
        match (self.min, self.max) {
            (0, 0) => format!("Method {method} takes no arguments"),
            (1, 1) => format!("Method {method} requires 1 argument"),
            (min, max) if min == max => {
                format!("Method {method} requires {min} arguments")
            }
            (min, max) => {
                format!("Method {method} requires {min} to {max} arguments")
            }
        }
    }
}

// A component whose methods can be called over the transport
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    // Name used in logs
    fn name(&self) -> &'static str;

    // Return the arity of the method, or None if the method doesn't exist
    fn arity(&self, method: &str) -> Option<Arity>;

    // Execute a request whose method and argument count were validated
    async fn call(&self, request: &Request) -> Result<WireValue, ServiceError>;
}
