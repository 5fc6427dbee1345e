//! Connection factory: candidate-host iteration, socket establishment, TLS
//! negotiation with PREFER/ALLOW fallback, startup, and the initial `SET`
//! queries that align the session with the requested options.

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::auth::{authenticate, AuthStrategies};
use crate::cancel::CancelChannel;
use crate::config::{ConnectOptions, Credentials, HostSpec, SslMode, TargetServerType};
use crate::errors::Error;
use crate::executor::{Connection, Inner};
use crate::stream::FramedStream;

/// Connect using the default (absent) GSS and SASL strategies.
pub async fn connect(options: ConnectOptions, credentials: Credentials) -> Result<Connection, Error> {
    connect_with_strategies(options, credentials, AuthStrategies::default()).await
}

/// Iterate the candidate hosts in the order the host chooser supplied them
/// and return the first connection that authenticates and matches the
/// requested server role.
pub async fn connect_with_strategies(
    options: ConnectOptions,
    credentials: Credentials,
    mut strategies: AuthStrategies,
) -> Result<Connection, Error> {
    if options.hosts.is_empty() {
        return Err(Error::UnableToConnect("no candidate hosts".into()));
    }

    let mut failures: Vec<String> = Vec::new();
    for host in options.hosts.clone() {
        match connect_host(&host, &options, &credentials, &mut strategies).await {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                warn!("Connection to {host} failed: {err}");
                failures.push(format!("{host}: {err}"));
            }
        }
    }
    Err(Error::UnableToConnect(failures.join("; ")))
}

/// TLS posture of one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Plain,
    Tls,
}

async fn connect_host(
    host: &HostSpec,
    options: &ConnectOptions,
    credentials: &Credentials,
    strategies: &mut AuthStrategies,
) -> Result<Connection, Error> {
    // PREFER downgrades to plaintext when authentication fails over TLS;
    // ALLOW upgrades to TLS when plaintext authentication fails.
    let attempts: &[Channel] = match options.ssl_mode {
        SslMode::Disable => &[Channel::Plain],
        SslMode::Allow => &[Channel::Plain, Channel::Tls],
        SslMode::Prefer => &[Channel::Tls, Channel::Plain],
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => &[Channel::Tls],
    };

    let mut last_err: Option<Error> = None;
    for (attempt, channel) in attempts.iter().enumerate() {
        match attempt_one(host, options, credentials, strategies, *channel).await {
            Ok(connection) => return Ok(connection),
            Err(err @ Error::AuthenticationRejected(_)) if attempt + 1 < attempts.len() => {
                info!(
                    "Authentication over {channel:?} to {host} failed, retrying the other channel: {err}"
                );
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::UnableToConnect(host.to_string())))
}

async fn attempt_one(
    host: &HostSpec,
    options: &ConnectOptions,
    credentials: &Credentials,
    strategies: &mut AuthStrategies,
    channel: Channel,
) -> Result<Connection, Error> {
    let socket = open_socket(host, options).await?;
    let mut stream = FramedStream::new(socket);

    let mut tls_material: Option<(native_tls::TlsConnector, String)> = None;
    if channel == Channel::Tls {
        match negotiate_tls(stream, host, options).await? {
            (upgraded, Some(material)) => {
                stream = upgraded;
                tls_material = Some(material);
            }
            (plain, None) => stream = plain,
        }
    }

    // The login timeout bounds the whole handshake; afterwards the regular
    // socket timeout takes over.
    if options.login_timeout.as_millis() > 0 {
        stream.set_deadline(options.login_timeout.as_millis() as u64);
    }
    let startup = authenticate(&mut stream, options, credentials, strategies).await?;
    stream.set_deadline(options.socket_timeout_ms);

    let identity = format!(
        "{}@{}/{}",
        credentials.user.as_deref().unwrap_or("(idp)"),
        host,
        options.database
    );
    info!(
        "Connected {identity}, backend pid {}, server protocol version {}",
        startup.process_id,
        startup.parameters.server_protocol_version()
    );

    let cancel = CancelChannel {
        host: host.host.clone(),
        port: host.port,
        tls: if stream.is_tls() { tls_material } else { None },
        timeout: options.cancel_signal_timeout,
        process_id: startup.process_id,
        secret_key: startup.secret_key,
    };

    let mut inner = Inner::new(
        stream,
        options.clone(),
        startup.parameters,
        startup.process_id,
        startup.secret_key,
        startup.transaction_status,
        identity,
    );

    check_target_server_type(&mut inner, options).await?;
    run_initial_sets(&mut inner, options).await?;

    Ok(Connection::assemble(inner, cancel))
}

async fn open_socket(host: &HostSpec, options: &ConnectOptions) -> Result<TcpStream, Error> {
    let connect = TcpStream::connect((host.host.as_str(), host.port));
    let stream = match timeout(options.connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(Error::UnableToConnect(format!(
                "could not connect to {host}: {err}"
            )))
        }
        Err(_) => {
            return Err(Error::UnableToConnect(format!(
                "connect to {host} timed out"
            )))
        }
    };

    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(&stream);
    if options.tcp_keep_alive {
        sock.set_keepalive(true)?;
    }
    if let Some(size) = options.receive_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    Ok(stream)
}

/// Run the SSL request dance. Returns the (possibly upgraded) stream plus the
/// connector material kept for the cancel channel.
async fn negotiate_tls(
    mut stream: FramedStream,
    host: &HostSpec,
    options: &ConnectOptions,
) -> Result<(FramedStream, Option<(native_tls::TlsConnector, String)>), Error> {
    match stream.request_tls().await? {
        b'S' => {
            let connector = build_tls_connector(options.ssl_mode)?;
            let tokio_connector = tokio_native_tls::TlsConnector::from(connector.clone());
            let stream = stream.upgrade_tls(&tokio_connector, &host.host).await?;
            debug!("TLS established with {host}");
            Ok((stream, Some((connector, host.host.clone()))))
        }
        b'N' => {
            if options.ssl_mode.accepts_plaintext() {
                debug!("Server {host} declined TLS, continuing in plaintext");
                Ok((stream, None))
            } else {
                Err(Error::ConnectionRejected(format!(
                    "server {host} does not support TLS but sslMode requires it"
                )))
            }
        }
        other => Err(Error::ProtocolViolation(format!(
            "unexpected TLS negotiation answer '{}' (ASCII {})",
            other as char, other
        ))),
    }
}

fn build_tls_connector(mode: SslMode) -> Result<native_tls::TlsConnector, Error> {
    let mut builder = native_tls::TlsConnector::builder();
    if !mode.verifies_certificate() {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if !mode.verifies_hostname() {
        builder.danger_accept_invalid_hostnames(true);
    }
    Ok(builder.build()?)
}

/// Reject hosts whose role does not match the requested target type.
/// A host is primary iff `transaction_read_only` is `off`.
async fn check_target_server_type(
    inner: &mut Inner,
    options: &ConnectOptions,
) -> Result<(), Error> {
    if options.target_server_type == TargetServerType::Any {
        return Ok(());
    }
    let read_only = match inner.parameters.get("transaction_read_only") {
        Some(value) => value == "on",
        None => {
            let outcome = inner.run_simple("show transaction_read_only").await?;
            outcome
                .first_value()
                .map(|v| v == b"on")
                .unwrap_or(false)
        }
    };
    let matches = match options.target_server_type {
        TargetServerType::Primary => !read_only,
        TargetServerType::Secondary => read_only,
        TargetServerType::Any => true,
    };
    if matches {
        Ok(())
    } else {
        inner.abort_socket().await;
        Err(Error::ConnectionFailure(format!(
            "host is {} but {:?} was requested",
            if read_only { "read-only" } else { "writable" },
            options.target_server_type
        )))
    }
}

/// Initial `SET` statements that depend on the discovered server version.
async fn run_initial_sets(inner: &mut Inner, options: &ConnectOptions) -> Result<(), Error> {
    // The startup packet asked for the conservative value when an old server
    // was assumed; upgrade once the real version is known.
    if options.extra_float_digits() < 3 {
        if let Some(version) = inner.parameters.server_version() {
            if version >= (9, 0) {
                inner.run_simple("SET extra_float_digits = 3").await?;
            }
        }
    }
    if let Some(name) = &options.application_name {
        if inner.parameters.get("application_name") != Some(name.as_str()) {
            let escaped = name.replace('\'', "''");
            inner
                .run_simple(&format!("SET application_name = '{escaped}'"))
                .await?;
        }
    }
    if let Some(group) = &options.query_group {
        let escaped = group.replace('\'', "''");
        inner
            .run_simple(&format!("SET query_group TO '{escaped}'"))
            .await?;
    }
    Ok(())
}
