use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::rpc::{
    Request, RpcService, SERVER_ERROR, ServiceError, WireValue,
};

// Upper bound on the size of one request line
const MAX_REQUEST_LEN: u64 = 64 * 1024;

// Accept connections and dispatch each one to a service on its own task
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    // Serve until the token is cancelled. Connections already being
    // handled are left to finish on their own
    pub async fn run<S: RpcService>(
        self,
        service: Arc<S>,
        run_token: CancellationToken,
    ) {
        match self.listener.local_addr() {
            Ok(addr) => info!("{}: Listening on {}", service.name(), addr),
            Err(err) => warn!("{}: Unknown local address: {err}", service.name()),
        }

        loop {
            select! {
                _ = run_token.cancelled() => {
                    info!("{}: Quiting", service.name());

                    break;
                },
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("{}: Client connected: {}", service.name(), peer);

                            let service = service.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, peer, service).await;
                            });
                        }
                        Err(err) => {
                            warn!("{}: Failed to accept connection: {err}", service.name());
                        }
                    }
                }
            }
        }
    }
}

// Read one request, answer it and close the connection on every path
async fn handle_connection<S: RpcService>(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<S>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_LEN));

    let mut line = String::new();
    let response = match reader.read_line(&mut line).await {
        Ok(_) => {
            trace!("{}: Received \"{}\" from {}", service.name(), line.trim(), peer);
            respond(service.clone(), &line).await
        }
        Err(err) => {
            warn!("{}: Failed to read request from {peer}: {err}", service.name());
            WireValue::from(SERVER_ERROR)
        }
    };

    if let Err(err) = writer.write_all(response.encode().as_bytes()).await {
        warn!("{}: Failed to send response to {peer}: {err}", service.name());
    }

    if let Err(err) = writer.shutdown().await {
        debug!("{}: Failed to close connection with {peer}: {err}", service.name());
    }
}

// Turn a request line into the value sent back to the caller
async fn respond<S: RpcService>(service: Arc<S>, line: &str) -> WireValue {
    let request = match Request::parse(line) {
        Ok(request) => request,
        Err(err) => return WireValue::from(err.to_string()),
    };

    let Some(arity) = service.arity(&request.method) else {
        let message = format!("Unknown method {}", request.method);
        warn!("{}: {message}", service.name());

        return WireValue::from(message);
    };

    if !arity.accepts(request.args.len()) {
        let message = arity.mismatch_message(&request.method);
        warn!("{}: {message}", service.name());

        return WireValue::from(message);
    }

    // Run the handler on its own task so that a panic still gets an answer
    let name = service.name();
    let handler = tokio::spawn(async move { service.call(&request).await });

    match handler.await {
        Ok(Ok(value)) => value,
        Ok(Err(ServiceError::Protocol(err))) => {
            warn!("{name}: {err}");
            WireValue::from(err.to_string())
        }
        Ok(Err(ServiceError::Internal(err))) => {
            for e in err.chain() {
                error!("{name}: {e}");
            }
            WireValue::from(SERVER_ERROR)
        }
        Err(err) => {
            error!("{name}: Handler failed: {err}");
            WireValue::from(SERVER_ERROR)
        }
    }
}
