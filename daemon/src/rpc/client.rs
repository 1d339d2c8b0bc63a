use std::{fmt::Display, io, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};
use tracing::{debug, trace};

use crate::{
    config::RpcConfig,
    rpc::{Request, TransportError, WireValue},
};

// Call methods of a remote component.
//
// A refused connection means the peer isn't started yet and is retried
// at a fixed interval. Every other failure, timeouts included, is
// returned to the caller without retrying since the call may not be
// idempotent.
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,

    call_timeout: Duration,
    retry_interval: Duration,

    // None retries refused connections forever
    max_connect_attempts: Option<u32>,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::from_config(addr, &RpcConfig::default())
    }

    pub fn from_config(addr: impl Into<String>, config: &RpcConfig) -> Self {
        Self {
            addr: addr.into(),
            call_timeout: config.call_timeout(),
            retry_interval: config.retry_interval(),
            max_connect_attempts: config.max_connect_attempts,
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_max_connect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    // Call a method with the default timeout
    pub async fn call(
        &self,
        method: &str,
        args: &[&(dyn Display + Sync)],
    ) -> Result<WireValue, TransportError> {
        self.call_with_timeout(method, args, self.call_timeout).await
    }

    // Call a method with a specific timeout, used for calls that
    // last as long as a whole benchmark run
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: &[&(dyn Display + Sync)],
        call_timeout: Duration,
    ) -> Result<WireValue, TransportError> {
        let args = args.iter().map(|arg| arg.to_string()).collect();
        let request = Request::new(method, args)?;

        let mut stream = self.connect(method, call_timeout).await?;

        let response = timeout(call_timeout, exchange(&mut stream, &request))
            .await
            .map_err(|_| TransportError::Timeout {
                addr: self.addr.clone(),
                method: method.to_string(),
                timeout: call_timeout,
            })?
            .map_err(|source| TransportError::Io {
                addr: self.addr.clone(),
                method: method.to_string(),
                source,
            })?;

        trace!("{} on {} answered \"{}\"", method, self.addr, response);

        Ok(WireValue::decode(&response))
    }

    // Open a connection, waiting for the peer to come up if needed
    async fn connect(
        &self,
        method: &str,
        connect_timeout: Duration,
    ) -> Result<TcpStream, TransportError> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let result = timeout(connect_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| TransportError::Timeout {
                    addr: self.addr.clone(),
                    method: method.to_string(),
                    timeout: connect_timeout,
                })?;

            match result {
                Ok(stream) => return Ok(stream),
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    if self
                        .max_connect_attempts
                        .is_some_and(|max| attempts >= max)
                    {
                        return Err(TransportError::Unreachable {
                            addr: self.addr.clone(),
                            attempts,
                        });
                    }

                    debug!(
                        "{} refused the connection (attempt {}), retrying in {:?}",
                        self.addr, attempts, self.retry_interval
                    );
                    sleep(self.retry_interval).await;
                }
                Err(source) => {
                    return Err(TransportError::Connect {
                        addr: self.addr.clone(),
                        source,
                    });
                }
            }
        }
    }
}

// Send the request line and read the reply until the peer closes
async fn exchange(
    stream: &mut TcpStream,
    request: &Request,
) -> io::Result<String> {
    let line = format!("{request}\n");
    stream.write_all(line.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;

    Ok(String::from_utf8_lossy(&buf).into_owned())
}
