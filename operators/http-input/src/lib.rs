//! HTTP input operator: receives log events as JSON objects.
//!
//! ## Endpoints
//!
//! - `POST /` with a JSON object as body creates an entry and returns `201 Created`.
//! - `GET /health` always returns `200 OK`, without authentication.
//!
//! ## Configuration
//!
//! ```toml
//! [[pipeline]]
//! type = "http_input"
//! listen_address = "0.0.0.0:8080"
//! max_body_size = 1048576
//!
//! [pipeline.auth]
//! token_header = "x-secret-key"
//! tokens = ["secret1", "secret2"]
//! ```
use std::{
    net::{SocketAddr, TcpListener},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::Context;
use hyper::{
    Server,
    server::{
        Builder,
        conn::{AddrIncoming, AddrStream},
    },
    service::{make_service_fn, service_fn},
};
use logsreceiver::operator::{Capability, Operator, StartContext, registry::OperatorBuilder};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub mod auth;
pub mod labels;
pub mod server;

use auth::{Auth, AuthConfig};
use server::Handler;

pub use server::{ParseError, RequestInfo, parse};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpInputConfig {
    /// Address to listen on, for instance `0.0.0.0:8080`.
    pub listen_address: SocketAddr,
    /// Maximum size of a request body, in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_max_body_size() -> u64 {
    10 * 1024 * 1024
}

/// Lifecycle of the HTTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    /// Waiting for the in-flight requests to complete.
    Stopping,
}

pub struct HttpInput {
    id: String,
    listen_address: SocketAddr,
    max_body_size: u64,
    auth: Auth,
    state: Arc<Mutex<ServerState>>,
    shutdown: Option<CancellationToken>,
    local_addr: Option<SocketAddr>,
}

impl HttpInput {
    pub fn new(id: &str, config: HttpInputConfig) -> anyhow::Result<Self> {
        let auth = Auth::try_from(config.auth).context("invalid auth config")?;
        if config.max_body_size == 0 {
            anyhow::bail!("max_body_size must be greater than zero");
        }
        Ok(Self {
            id: id.to_owned(),
            listen_address: config.listen_address,
            max_body_size: config.max_body_size,
            auth,
            state: Arc::new(Mutex::new(ServerState::Stopped)),
            shutdown: None,
            local_addr: None,
        })
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    /// The address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn set_state(&self, state: ServerState) {
        *lock(&self.state) = state;
    }
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Operator for HttpInput {
    fn start(&mut self, ctx: &mut dyn StartContext) -> anyhow::Result<()> {
        if self.state() != ServerState::Stopped {
            anyhow::bail!("http input '{}' is already started", self.id);
        }
        self.set_state(ServerState::Starting);

        // Bind now, so that an unavailable address fails the start.
        let bind = || -> anyhow::Result<(SocketAddr, Builder<AddrIncoming>)> {
            let listener = TcpListener::bind(self.listen_address)
                .with_context(|| format!("failed to listen on {}", self.listen_address))?;
            listener.set_nonblocking(true)?;
            let local_addr = listener.local_addr()?;
            Ok((local_addr, Server::from_tcp(listener)?))
        };
        let (local_addr, builder) = match bind() {
            Ok(bound) => bound,
            Err(e) => {
                self.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        let handler = Arc::new(Handler {
            operator_id: self.id.clone(),
            auth: self.auth.clone(),
            max_body_size: self.max_body_size,
            output: ctx.output(),
        });
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let handler = handler.clone();
            let remote_addr = conn.remote_addr();
            async move {
                Ok::<_, std::convert::Infallible>(service_fn(move |req| handler.clone().handle(req, remote_addr)))
            }
        });

        let shutdown = ctx.shutdown_token();
        let server = builder
            .serve(make_svc)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let state = self.state.clone();
        let id = self.id.clone();
        ctx.spawn(Box::pin(async move {
            let res = server.await;
            *lock(&state) = ServerState::Stopped;
            log::info!("HTTP input '{id}' stopped.");
            res.context("http server failed")
        }));

        self.shutdown = Some(shutdown);
        self.local_addr = Some(local_addr);
        self.set_state(ServerState::Running);
        log::info!("HTTP input '{}' listening on http://{local_addr}", self.id);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            // the server task sets the state to stopped when the requests are done
            let mut state = lock(&self.state);
            if *state == ServerState::Running {
                *state = ServerState::Stopping;
            }
            drop(state);
            shutdown.cancel();
            log::debug!("Stopping HTTP input '{}'...", self.id);
        }
        Ok(())
    }
}

impl OperatorBuilder for HttpInput {
    type Config = HttpInputConfig;

    fn type_name() -> &'static str {
        "http_input"
    }

    fn capability() -> Capability {
        Capability::Input
    }

    fn build(id: &str, config: HttpInputConfig) -> anyhow::Result<Box<Self>> {
        Ok(Box::new(HttpInput::new(id, config)?))
    }
}
