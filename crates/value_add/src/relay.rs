//! A TCP relay value-add: every connection made to the local server is
//! forwarded to one fixed target.

use anyhow::{Context, Result};
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

use crate::message::{ATTR_NAME, ServerProperties, TransportName};

/// Bind a loopback listener and describe it for the host.
pub async fn bind(name: &str) -> Result<(TcpListener, ServerProperties)> {
    let listener = TcpListener::bind("127.0.0.1:0").await.context("binding the relay listener")?;
    let port = listener.local_addr()?.port();
    let props = ServerProperties::new(TransportName::Tcp, port).with_attribute(ATTR_NAME, name);
    Ok((listener, props))
}

/// Accept forever, piping each connection to `target`.
pub async fn serve(listener: TcpListener, target: String) -> Result<()> {
    loop {
        let (mut inbound, from) = listener.accept().await.context("accepting a relay connection")?;
        let target = target.clone();
        debug!(%from, %target, "relaying connection");
        tokio::spawn(async move {
            let mut outbound = match TcpStream::connect(&target).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%target, "could not reach relay target: {e}");
                    return;
                }
            };
            match copy_bidirectional(&mut inbound, &mut outbound).await {
                Ok((up, down)) => info!(%from, up, down, "relay connection closed"),
                Err(e) => debug!(%from, "relay connection ended: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn connections_reach_the_target() {
        let target = echo_server().await;
        let (listener, props) = bind("relay").await.unwrap();
        let port = props.port().unwrap().parse::<u16>().unwrap();
        assert_eq!(props.transport_name(), Some("TCP"));
        tokio::spawn(serve(listener, target));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello through the relay").await.unwrap();
        let mut buf = vec![0u8; 23];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello through the relay");
    }
}
