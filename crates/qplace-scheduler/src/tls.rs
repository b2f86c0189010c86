//! Mutual TLS for inbound broker connections.
//!
//! The certificate directory holds three PEM files:
//! 1. `ca.crt`: the CA that signs broker client certificates
//! 2. `tls.crt`: the scheduler's own certificate chain
//! 3. `tls.key`: the scheduler's private key
//!
//! Brokers must present a client certificate issued by the CA. Its subject
//! common name is taken as the broker's external identity.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub const CA_FILE: &str = "ca.crt";
pub const CERT_FILE: &str = "tls.crt";
pub const KEY_FILE: &str = "tls.key";

/// Build a TLS acceptor that requires client certificates signed by the
/// directory's CA.
pub fn load_server_config(cert_dir: &Path) -> anyhow::Result<TlsAcceptor> {
    let ca = load_certs(&cert_dir.join(CA_FILE))?;
    let chain = load_certs(&cert_dir.join(CERT_FILE))?;
    let key = load_key(&cert_dir.join(KEY_FILE))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in ca {
        roots.add(cert).context("adding CA certificate")?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .context("building client certificate verifier")?;

    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .context("loading scheduler certificate")?;

    info!(dir = %cert_dir.display(), "mutual TLS enabled for broker connections");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Subject common name of the leaf certificate a peer presented.
pub fn peer_identity(certs: &[CertificateDer<'_>]) -> Option<String> {
    let leaf = certs.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("reading {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}
