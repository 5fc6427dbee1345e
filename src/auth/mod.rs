//! Startup packet assembly and the authentication handshake loop.

pub mod digest;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};

use crate::config::{ConnectOptions, Credentials};
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{frontend, parse_error_fields, BytesMutReader};
use crate::parameters::ServerParameters;
use crate::stream::FramedStream;

use digest::{client_nonce, DigestChallenge};

/// GSSAPI/SSPI handshake steps, provided by an external collaborator.
pub trait GssStrategy: Send {
    fn initial_token(&mut self) -> Result<Vec<u8>, Error>;
    /// Returns the next token to send, or `None` when the exchange is done.
    fn continue_token(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, Error>;
}

/// SASL/SCRAM handshake steps, provided by an external collaborator.
pub trait SaslStrategy: Send {
    /// Pick a mechanism and produce the initial response.
    fn initial_response(&mut self, mechanisms: &[String]) -> Result<(String, Vec<u8>), Error>;
    fn continue_response(&mut self, data: &[u8]) -> Result<Vec<u8>, Error>;
    fn finish(&mut self, data: &[u8]) -> Result<(), Error>;
}

/// Optional handshake collaborators. Absent strategies make the matching
/// server request fail instead of being silently skipped.
#[derive(Default)]
pub struct AuthStrategies {
    pub gss: Option<Box<dyn GssStrategy>>,
    pub sasl: Option<Box<dyn SaslStrategy>>,
}

/// Everything the startup exchange yields.
#[derive(Debug)]
pub struct SessionStartup {
    pub process_id: i32,
    pub secret_key: i32,
    pub parameters: ServerParameters,
    pub transaction_status: u8,
}

/// Assemble the startup parameter pairs in wire order.
pub fn startup_parameters(options: &ConnectOptions, credentials: &Credentials) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = Vec::new();
    let native_idp = options.idp_identity.is_some();

    // A native IDP plugin may omit the user; identity comes from the token.
    if let Some(user) = &credentials.user {
        params.push(("user".into(), user.clone()));
    } else if !native_idp {
        params.push(("user".into(), String::new()));
    }
    params.push(("database".into(), options.database.clone()));
    params.push(("client_encoding".into(), "UTF8".into()));
    params.push(("DateStyle".into(), "ISO".into()));
    if let Some(zone) = startup_time_zone() {
        params.push(("TimeZone".into(), zone));
    }
    if options.compression {
        params.push(("_pq_.compression".into(), "lz4".into()));
    }
    params.push((
        "extra_float_digits".into(),
        options.extra_float_digits().to_string(),
    ));
    if let Some(name) = &options.application_name {
        params.push(("application_name".into(), name.clone()));
    }
    if let Some(schema) = &options.current_schema {
        params.push(("search_path".into(), schema.clone()));
    }
    if let Some(options_str) = &options.options {
        params.push(("options".into(), options_str.clone()));
    }
    params.push(("driver_version".into(), options.driver_version.clone()));
    params.push(("os_version".into(), options.os_version.clone()));
    if let Some(plugin) = &options.plugin_name {
        params.push(("plugin_name".into(), plugin.clone()));
    }
    params.push((
        "client_protocol_version".into(),
        options.client_protocol_version.to_string(),
    ));
    if let Some(idp) = &options.idp_identity {
        params.push(("idp_type".into(), idp.idp_type.clone()));
        params.push(("provider_name".into(), idp.provider_name.clone()));
        params.push(("token_type".into(), idp.token_type.clone()));
        if let Some(namespace) = &idp.identity_namespace {
            params.push(("identity_namespace".into(), namespace.clone()));
        }
        if let Some(display) = &idp.idc_client_display_name {
            params.push(("idc_client_display_name".into(), display.clone()));
        }
    }
    params
}

/// The local zone expressed in the POSIX-inverted form the server expects:
/// an offset of +N hours maps to `GMT-N` and vice versa.
fn startup_time_zone() -> Option<String> {
    use chrono::Offset;
    let offset = chrono::Local::now().offset().fix();
    let seconds = offset.local_minus_utc();
    if seconds == 0 {
        return Some("GMT".into());
    }
    let sign = if seconds > 0 { '-' } else { '+' };
    let abs = seconds.unsigned_abs();
    Some(format!("GMT{sign}{:02}:{:02}", abs / 3600, (abs % 3600) / 60))
}

/// Send the startup packet, run the authentication loop, and process the
/// readiness messages up to ReadyForQuery.
pub async fn authenticate(
    stream: &mut FramedStream,
    options: &ConnectOptions,
    credentials: &Credentials,
    strategies: &mut AuthStrategies,
) -> Result<SessionStartup, Error> {
    let params = startup_parameters(options, credentials);
    stream.send_bytes(&frontend::startup(&params));
    stream.flush().await?;

    let mut process_id = 0;
    let mut secret_key = 0;
    let mut parameters = ServerParameters::new();

    loop {
        let (code, mut payload) = stream.read_message().await?;
        match code {
            BACKEND_AUTHENTICATION => {
                if payload.remaining() < 4 {
                    return Err(Error::ProtocolViolation(
                        "authentication request is truncated".into(),
                    ));
                }
                let subtype = payload.get_i32();
                handle_auth_request(stream, subtype, payload, credentials, strategies).await?;
            }

            BACKEND_ERROR_RESPONSE => {
                let err = parse_error_fields(&mut payload, options.log_server_error_detail)?;
                return Err(Error::AuthenticationRejected(err.to_string()));
            }

            BACKEND_BACKEND_KEY_DATA => {
                if payload.remaining() < 8 {
                    return Err(Error::ProtocolViolation(
                        "backend key data is truncated".into(),
                    ));
                }
                process_id = payload.get_i32();
                secret_key = payload.get_i32();
            }

            BACKEND_PARAMETER_STATUS => {
                let key = payload.read_string()?;
                let value = payload.read_string()?;
                parameters.set(&key, &value);
            }

            BACKEND_NOTICE_RESPONSE => {
                if let Ok(notice) = parse_error_fields(&mut payload, true) {
                    warn!(
                        "Server startup notice (severity: {} code: {} message: {})",
                        notice.severity, notice.code, notice.message
                    );
                }
            }

            BACKEND_READY_FOR_QUERY => {
                if !payload.has_remaining() {
                    return Err(Error::ProtocolViolation(
                        "ready-for-query carries no status".into(),
                    ));
                }
                let transaction_status = payload.get_u8();
                debug!(
                    "Authenticated; backend pid {process_id}, transaction status '{}'",
                    transaction_status as char
                );
                return Ok(SessionStartup {
                    process_id,
                    secret_key,
                    parameters,
                    transaction_status,
                });
            }

            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected message '{}' during startup",
                    other as char
                )));
            }
        }
    }
}

async fn handle_auth_request(
    stream: &mut FramedStream,
    subtype: i32,
    mut payload: BytesMut,
    credentials: &Credentials,
    strategies: &mut AuthStrategies,
) -> Result<(), Error> {
    match subtype {
        AUTHENTICATION_SUCCESSFUL => Ok(()),

        AUTHENTICATION_CLEAR_PASSWORD => {
            let password = require_password(credentials)?;
            stream.send_bytes(&frontend::password_message(password));
            stream.flush().await
        }

        AUTHENTICATION_MD5_PASSWORD => {
            let password = require_password(credentials)?;
            let user = credentials.user.as_deref().unwrap_or("");
            if payload.remaining() < 4 {
                return Err(Error::ProtocolViolation("md5 salt is truncated".into()));
            }
            let salt = payload.split_to(4);
            stream.send_bytes(&frontend::md5_password(user, password, &salt));
            stream.flush().await
        }

        AUTHENTICATION_DIGEST => {
            let password = require_password(credentials)?;
            let challenge = DigestChallenge::parse(&mut payload)?;
            let digest = challenge.digest(password);
            let nonce = client_nonce();
            stream.send_bytes(&frontend::digest_response(&digest, &nonce));
            stream.flush().await
        }

        AUTHENTICATION_IDP_TOKEN => {
            let token = credentials.idp_token.as_deref().ok_or_else(|| {
                Error::AuthenticationRejected(
                    "server requested an IDP token but none was resolved".into(),
                )
            })?;
            stream.send_bytes(&frontend::idp_token_message(token));
            stream.flush().await
        }

        AUTHENTICATION_GSS | AUTHENTICATION_SSPI => {
            let strategy = strategies.gss.as_mut().ok_or_else(|| {
                Error::NotSupported("GSS authentication without a GSS strategy".into())
            })?;
            let token = strategy.initial_token()?;
            send_auth_data(stream, &token).await
        }

        AUTHENTICATION_GSS_CONTINUE => {
            let strategy = strategies.gss.as_mut().ok_or_else(|| {
                Error::NotSupported("GSS continuation without a GSS strategy".into())
            })?;
            match strategy.continue_token(&payload)? {
                Some(token) => send_auth_data(stream, &token).await,
                None => Ok(()),
            }
        }

        AUTHENTICATION_SASL => {
            let strategy = strategies.sasl.as_mut().ok_or_else(|| {
                Error::NotSupported("SASL authentication without a SCRAM strategy".into())
            })?;
            let mut mechanisms = Vec::new();
            while payload.has_remaining() && payload[0] != 0 {
                mechanisms.push(payload.read_string()?);
            }
            let (mechanism, response) = strategy.initial_response(&mechanisms)?;

            let mut message = BytesMut::new();
            message.put_u8(FRONTEND_PASSWORD);
            message.put_i32(4 + mechanism.len() as i32 + 1 + 4 + response.len() as i32);
            message.put_slice(mechanism.as_bytes());
            message.put_u8(0);
            message.put_i32(response.len() as i32);
            message.put_slice(&response);
            stream.send_bytes(&message);
            stream.flush().await
        }

        AUTHENTICATION_SASL_CONTINUE => {
            let strategy = strategies.sasl.as_mut().ok_or_else(|| {
                Error::NotSupported("SASL continuation without a SCRAM strategy".into())
            })?;
            let response = strategy.continue_response(&payload)?;
            send_auth_data(stream, &response).await
        }

        AUTHENTICATION_SASL_FINAL => {
            let strategy = strategies.sasl.as_mut().ok_or_else(|| {
                Error::NotSupported("SASL final without a SCRAM strategy".into())
            })?;
            strategy.finish(&payload)
        }

        other => Err(Error::ProtocolViolation(format!(
            "unknown authentication request subtype {other}"
        ))),
    }
}

fn require_password(credentials: &Credentials) -> Result<&str, Error> {
    credentials.password.as_deref().ok_or_else(|| {
        Error::AuthenticationRejected("server requested a password but none was resolved".into())
    })
}

async fn send_auth_data(stream: &mut FramedStream, data: &[u8]) -> Result<(), Error> {
    let mut message = BytesMut::with_capacity(data.len() + 5);
    message.put_u8(FRONTEND_PASSWORD);
    message.put_i32(4 + data.len() as i32);
    message.put_slice(data);
    stream.send_bytes(&message);
    stream.flush().await
}
