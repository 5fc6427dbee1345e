//! Query cancellation side channel.
//!
//! A cancel request travels over its own short-lived connection: open a fresh
//! socket to the same host, write the 16-byte cancel packet carrying the
//! backend pid and secret key, read until EOF, close. It shares no state with
//! the main connection, so it is safe while a query is in flight.

use std::time::Duration;

use log::warn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::errors::Error;
use crate::messages::frontend;

#[derive(Clone)]
pub(crate) struct CancelChannel {
    pub host: String,
    pub port: u16,
    /// Present when the main connection is encrypted and the server requires
    /// the same for cancel requests.
    pub tls: Option<(native_tls::TlsConnector, String)>,
    pub timeout: Duration,
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelChannel {
    pub async fn send(&self) -> Result<(), Error> {
        match timeout(self.timeout, self.run()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn run(&self) -> Result<(), Error> {
        warn!(
            "Sending CancelRequest to [{}] {}:{}",
            self.process_id, self.host, self.port
        );
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|err| Error::UnableToConnect(format!("cancel channel: {err}")))?;

        let packet = frontend::cancel_request(self.process_id, self.secret_key);
        match &self.tls {
            Some((connector, domain)) => {
                let connector = tokio_native_tls::TlsConnector::from(connector.clone());
                let mut stream = upgrade(stream, &connector, domain).await?;
                stream.write_all(&packet).await?;
                stream.flush().await?;
                let mut sink = [0u8; 16];
                // The server answers with EOF.
                let _ = stream.read(&mut sink).await;
                let _ = stream.shutdown().await;
            }
            None => {
                let mut stream = stream;
                stream.write_all(&packet).await?;
                stream.flush().await?;
                let mut sink = [0u8; 16];
                let _ = stream.read(&mut sink).await;
                let _ = stream.shutdown().await;
            }
        }
        Ok(())
    }
}

async fn upgrade(
    mut stream: TcpStream,
    connector: &tokio_native_tls::TlsConnector,
    domain: &str,
) -> Result<tokio_native_tls::TlsStream<TcpStream>, Error> {
    stream.write_all(&frontend::ssl_request()).await?;
    stream.flush().await?;
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await?;
    match answer[0] {
        b'S' => connector.connect(domain, stream).await.map_err(Error::Tls),
        b'N' => Err(Error::ConnectionRejected(
            "server refused TLS on the cancel channel".into(),
        )),
        other => Err(Error::ProtocolViolation(format!(
            "unexpected TLS negotiation answer '{}'",
            other as char
        ))),
    }
}
