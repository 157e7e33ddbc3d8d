//! TLS Client Builder: wraps a TCP stream in a client TLS stream, with an
//! accept-certificate hook and a peer-certificate-changed notifier.
//!
//! Grounded in the teacher's `build_client_config`/`cert_reader`/
//! `load_root_store` (CA + client-cert loading) and in
//! `wmsyw-Aether`'s `build_tls_config` (webpki-roots default database).
//! The accept-certificate accumulator has no direct rustls analogue, so it
//! is realized as a custom `ServerCertVerifier` that falls back to the
//! default webpki verification and only consults observers on failure —
//! the same "hook before reject" shape as libsoup's
//! `tls_connection_accept_certificate`.

use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::ConnectionError;
use crate::events::{CertificateErrors, Property, Signals};
use crate::socket_props::SocketProperties;

/// Client-certificate material offered during the handshake (mTLS).
pub struct TlsInteraction {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl fmt::Debug for TlsInteraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsInteraction")
            .field("cert_chain_len", &self.cert_chain.len())
            .finish()
    }
}

impl TlsInteraction {
    /// Loads a client-certificate chain and PKCS8 private key from PEM
    /// files on disk, the way a session would populate `SocketProperties`
    /// before constructing a Connection (there is no file-loading surface
    /// on the core itself). Grounded in the teacher's
    /// `cert_reader`/`privkey_reader`.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ConnectionError> {
        let cert_chain = read_certs(cert_path)?;
        let private_key = read_private_key(key_path)?;
        Ok(TlsInteraction {
            cert_chain,
            private_key,
        })
    }
}

fn read_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, ConnectionError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(ConnectionError::tcp)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .map(|res| res.map_err(ConnectionError::tcp))
        .collect()
}

fn read_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, ConnectionError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(ConnectionError::tcp)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::pkcs8_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(ConnectionError::tcp)?
        .map(PrivateKeyDer::Pkcs8)
        .ok_or_else(|| {
            ConnectionError::TlsInit(format!("no PKCS8 private key found in {}", path.display()))
        })
}

/// Loads an explicit root-of-trust database from a PEM CA bundle, the
/// on-disk counterpart of [`TlsDatabase::UseDefault`]. Grounded in the
/// teacher's `load_root_store`.
pub fn load_root_store_from_pem(
    ca_path: impl AsRef<Path>,
) -> Result<RootCertStore, ConnectionError> {
    let ca_certs = read_certs(ca_path)?;
    let mut store = RootCertStore::empty();
    let (added, _skipped) = store.add_parsable_certificates(ca_certs);
    if added == 0 {
        return Err(ConnectionError::TlsInit(
            "CA bundle did not contain any valid certificates".into(),
        ));
    }
    Ok(store)
}

/// Which root-of-trust database to validate the peer certificate against.
#[derive(Clone, Default)]
pub enum TlsDatabase {
    /// The bundled `webpki-roots` set, refreshed independently of the
    /// operating system's trust store.
    #[default]
    UseDefault,
    /// An explicit root store (e.g. loaded from a CA bundle file).
    Explicit(Arc<RootCertStore>),
}

/// A rustls `ServerCertVerifier` that defers to the Connection's
/// `accept-certificate` accumulator when the default WebPKI verification
/// rejects the peer certificate.
#[derive(Debug)]
struct AcceptCertificateVerifier {
    inner: Arc<WebPkiServerVerifier>,
    signals: Signals,
}

impl ServerCertVerifier for AcceptCertificateVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'static>,
        intermediates: &[CertificateDer<'static>],
        server_name: &ServerName<'static>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(err) => {
                let errors = CertificateErrors {
                    message: err.to_string(),
                };
                if self
                    .signals
                    .emit_accept_certificate(end_entity, &errors)
                {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'static>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'static>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn root_store_for(database: &TlsDatabase) -> RootCertStore {
    match database {
        TlsDatabase::Explicit(store) => (**store).clone(),
        TlsDatabase::UseDefault => {
            RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
        }
    }
}

fn build_client_config(
    props: &SocketProperties,
    signals: &Signals,
) -> Result<ClientConfig, ConnectionError> {
    let root_store = root_store_for(&props.tls_database);
    let provider: Arc<CryptoProvider> = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let webpki_verifier = WebPkiServerVerifier::builder_with_provider(
        Arc::new(root_store),
        provider.clone(),
    )
    .build()
    .map_err(|e| ConnectionError::TlsInit(format!("failed to build certificate verifier: {e}")))?;

    let verifier = Arc::new(AcceptCertificateVerifier {
        inner: webpki_verifier,
        signals: signals.clone(),
    });

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionError::TlsInit(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match &props.tls_interaction {
        Some(interaction) => builder
            .with_client_auth_cert(interaction.cert_chain.clone(), interaction.private_key.clone())
            .map_err(|e| ConnectionError::TlsInit(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

/// Wraps `tcp` in a client TLS stream using `props`'s configured database
/// and client-cert material, emitting `tls-handshaking`/notifying
/// `tls_certificate` through `signals` as appropriate to the caller
/// (the caller emits the events; this function only performs the I/O).
pub(crate) async fn handshake(
    tcp: TcpStream,
    server_name: ServerName<'static>,
    props: &SocketProperties,
    signals: &Signals,
) -> Result<TlsStream<TcpStream>, ConnectionError> {
    let config = build_client_config(props, signals)?;
    let connector = TlsConnector::from(Arc::new(config));

    match connector.connect(server_name, tcp).await {
        Ok(stream) => {
            signals.notify(Property::TlsCertificate);
            Ok(stream)
        }
        Err(err) => Err(ConnectionError::Tls(err.to_string())),
    }
}

/// Reads the peer certificate chain's leaf certificate, if the stream is
/// currently a TLS stream with a completed handshake.
pub(crate) fn peer_certificate(
    stream: &TlsStream<TcpStream>,
) -> Option<CertificateDer<'static>> {
    let (_, session) = stream.get_ref();
    session
        .peer_certificates()
        .and_then(|certs| certs.first().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_database_builds_non_empty_root_store() {
        let store = root_store_for(&TlsDatabase::UseDefault);
        assert!(store.len() > 0);
    }
}
