//! The server frontend: binds a TCP or UNIX-domain listener, optionally
//! negotiates implicit TLS on accept, and spawns one [`Dispatcher`] task per
//! connection. See `spec.md` §6.

use std::io;
use std::sync::Arc;

use log::{error, info, warn};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::handler::Handler;
use crate::model::{Session, TlsInfo, TlsState};
use crate::transport::LineTransport;

/// Owns the listening socket(s) and the shared `Config`/`Handler`, and drives
/// the accept loop until `shutdown` is cancelled.
pub struct Server {
    config: Arc<Config>,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: Config, handler: Arc<dyn Handler>, shutdown: CancellationToken) -> Self {
        Server {
            config: Arc::new(config),
            handler,
            shutdown,
        }
    }

    /// Runs until `shutdown` fires or the listener itself fails.
    pub async fn run(self) -> io::Result<()> {
        if self.config.implicit_tls && self.config.require_starttls {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "implicit_tls and require_starttls are mutually exclusive",
            ));
        }

        let tls_acceptor = self.build_tls_acceptor()?;

        if let Some(path) = &self.config.unix_socket_path {
            self.run_unix(path, tls_acceptor).await
        } else {
            self.run_tcp(tls_acceptor).await
        }
    }

    fn build_tls_acceptor(&self) -> io::Result<Option<Arc<TlsAcceptor>>> {
        let (Some(cert_path), Some(key_path)) = (&self.config.tls_cert_path, &self.config.tls_key_path) else {
            if self.config.implicit_tls {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "implicit_tls requires tls_cert_path and tls_key_path",
                ));
            }
            return Ok(None);
        };

        let cert_file = std::fs::File::open(cert_path)?;
        let key_file = std::fs::File::open(key_path)?;
        let cert_chain: Vec<CertificateDer<'static>> = certs(&mut io::BufReader::new(cert_file)).collect::<Result<_, _>>()?;
        let mut keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut io::BufReader::new(key_file))
            .map(|k| k.map(PrivateKeyDer::Pkcs8))
            .collect::<Result<_, _>>()?;
        let key = keys
            .pop()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found in tls_key_path"))?;

        let server_config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(server_config)))))
    }

    async fn run_tcp(self, tls_acceptor: Option<Arc<TlsAcceptor>>) -> io::Result<()> {
        // An empty hostname means "listen on all interfaces, both families",
        // matching the dual-stack convention of binding the unspecified address.
        let bind_addr = if self.config.smtp_bind_address.is_empty() {
            format!("[::]:{}", self.config.smtp_port)
        } else {
            format!("{}:{}", self.config.smtp_bind_address, self.config.smtp_port)
        };

        let listener = TcpListener::bind(&bind_addr).await?;
        info!("smtp-core listening on {}", bind_addr);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("smtp-core shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    self.spawn_connection(stream, peer.to_string(), tls_acceptor.clone());
                }
            }
        }
    }

    async fn run_unix(self, path: &str, tls_acceptor: Option<Arc<TlsAcceptor>>) -> io::Result<()> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!("smtp-core listening on unix:{}", path);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("smtp-core shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    self.spawn_connection(stream, path.to_string(), tls_acceptor.clone());
                }
            }
        }
    }

    fn spawn_connection<IO>(&self, stream: IO, peer: String, tls_acceptor: Option<Arc<TlsAcceptor>>)
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.config.clone();
        let handler = self.handler.clone();
        let implicit_tls = config.implicit_tls;

        tokio::spawn(async move {
            let result = if implicit_tls {
                Self::run_implicit_tls(stream, peer, config, handler, tls_acceptor).await
            } else {
                Dispatcher::new(stream, peer, config, handler, tls_acceptor).run().await
            };
            if let Err(e) = result {
                error!("connection terminated with error: {}", e);
            }
        });
    }

    async fn run_implicit_tls<IO>(
        stream: IO,
        peer: String,
        config: Arc<Config>,
        handler: Arc<dyn Handler>,
        tls_acceptor: Option<Arc<TlsAcceptor>>,
    ) -> Result<(), crate::error::SmtpError>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let acceptor = tls_acceptor.expect("implicit_tls validated at startup to require a TLS acceptor");
        let plain = LineTransport::new(stream, config.line_length_limit, config.data_size_limit);
        let tls_transport = plain.upgrade_tls(&acceptor).await?;

        let tls_info = tls_transport.tls_info().unwrap_or(TlsInfo {
            protocol_version: "unknown".to_string(),
            cipher_suite: "unknown".to_string(),
            peer_certificate_present: false,
        });

        let mut session = Session::new(peer);
        session.tls_state = TlsState::Active;
        session.tls_info = Some(tls_info);

        Dispatcher::new_tls(session, tls_transport, config, handler).run().await
    }
}
