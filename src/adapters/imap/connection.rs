//! IMAP endpoint dialing and authentication
//!
//! TCP (optionally TLS) via the tokio compat layer, then LOGIN, AUTH=LOGIN
//! or SASL XOAUTH2 depending on the configured method. The whole dial is
//! bounded by the endpoint's connect timeout.

use std::time::Duration;

use async_imap::Client;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::ImapEndpoint;
use crate::backend::{EndpointConnector, MailEndpoint};
use crate::config::{AuthMethod, EndpointConfig};
use crate::error::{FerryError, Result};

/// Dials real IMAP endpoints.
#[derive(Debug, Default, Clone)]
pub struct ImapConnector;

impl ImapConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EndpointConnector for ImapConnector {
    async fn connect(&self, config: &EndpointConfig) -> Result<Box<dyn MailEndpoint>> {
        connect(config).await
    }
}

/// Establish and authenticate a session within the configured timeout.
pub async fn connect(config: &EndpointConfig) -> Result<Box<dyn MailEndpoint>> {
    let deadline = Duration::from_secs(config.connect_timeout_secs);
    tokio::time::timeout(deadline, dial(config))
        .await
        .map_err(|_| {
            FerryError::ConnectionTimeout(format!(
                "{}:{} did not complete handshake within {}s",
                config.host, config.port, config.connect_timeout_secs
            ))
        })?
}

async fn dial(config: &EndpointConfig) -> Result<Box<dyn MailEndpoint>> {
    info!(host = %config.host, port = config.port, tls = config.tls, "Connecting to IMAP server");

    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| FerryError::Connection(format!("TCP connection failed: {}", e)))?;

    if config.tls {
        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = tls
            .connect(&config.host, tcp)
            .await
            .map_err(|e| FerryError::Tls(format!("TLS handshake failed: {}", e)))?;
        let session = authenticate(Client::new(tls_stream), config).await?;
        Ok(Box::new(ImapEndpoint::new(session)))
    } else {
        let session = authenticate(Client::new(tcp), config).await?;
        Ok(Box::new(ImapEndpoint::new(session)))
    }
}

async fn authenticate<S>(
    client: Client<S>,
    config: &EndpointConfig,
) -> Result<async_imap::Session<S>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    debug!(username = %config.username, "Authenticating");

    match &config.auth {
        AuthMethod::Password { password } => client
            .login(&config.username, password)
            .await
            .map_err(|(e, _)| login_error(e, &config.username)),
        AuthMethod::Login { password } => {
            let authenticator = LoginAuthenticator::new(&config.username, password);
            client
                .authenticate("LOGIN", authenticator)
                .await
                .map_err(|(e, _)| login_error(e, &config.username))
        }
        AuthMethod::OAuth2 { access_token } => {
            let authenticator = XOAuth2 {
                user: config.username.clone(),
                access_token: access_token.clone(),
            };
            client
                .authenticate("XOAUTH2", authenticator)
                .await
                .map_err(|(e, _)| login_error(e, &config.username))
        }
    }
}

/// Map a failed login to an actionable error. Transport errors keep their
/// connection class so the caller can retry; everything else is an
/// authentication failure and must not be retried automatically.
fn login_error(err: async_imap::error::Error, username: &str) -> FerryError {
    match err {
        async_imap::error::Error::Io(e) => {
            FerryError::Connection(format!("connection lost during login: {}", e))
        }
        other => FerryError::Auth(format!(
            "login rejected for {}: {}; if the provider requires it, use an \
             application-specific password",
            username, other
        )),
    }
}

/// AUTH=LOGIN challenge/response: the server prompts for the username and
/// the password in turn.
struct LoginAuthenticator {
    username: String,
    password: String,
    step: usize,
}

impl LoginAuthenticator {
    fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            step: 0,
        }
    }
}

impl async_imap::Authenticator for LoginAuthenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        let response = if self.step == 0 {
            self.username.clone()
        } else {
            self.password.clone()
        };
        self.step += 1;
        response
    }
}

/// SASL XOAUTH2 initial response carrying a bearer token.
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}
