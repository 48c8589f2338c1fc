//! TLS policy for peer connections.
//!
//! Peers are identified by a link-local address and a pre-provisioned or
//! self-issued certificate, not by a DNS name. The client therefore
//! accepts any peer certificate that chains to the caller-supplied roots
//! and skips hostname verification entirely. That policy is
//! [ChainTrustVerifier], spelled out as its own type rather than an
//! inline shortcut; callers opt into it by handing their [TrustMaterial]
//! to the client.

#[cfg(test)]
pub(crate) mod testing;

use rustls::client::Resumption;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::pem::PemObject as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

pub use rustls::crypto::aws_lc_rs::default_provider;

/// Certificate material supplied by the embedding application.
///
/// The transport treats it as opaque: the roots anchor chain validation
/// of peer certificates, the chain and key authenticate this side of the
/// connection.
pub struct TrustMaterial {
    roots: RootCertStore,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TrustMaterial {
    pub fn new(
        roots: RootCertStore,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            roots,
            cert_chain,
            key,
        }
    }

    /// Load from PEM: concatenated root certificates, the client
    /// certificate chain, and the client private key.
    pub fn from_pem(roots_pem: &[u8], chain_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(roots_pem) {
            roots.add(cert?)?;
        }
        let cert_chain = CertificateDer::pem_slice_iter(chain_pem).collect::<Result<Vec<_>, _>>()?;
        let key = PrivateKeyDer::from_pem_slice(key_pem)?;
        Ok(Self {
            roots,
            cert_chain,
            key,
        })
    }
}

/// Create a TlsConnector (client side) for the given trust material.
pub(crate) fn make_tls_connector(trust: TrustMaterial) -> anyhow::Result<TlsConnector> {
    let verifier = ChainTrustVerifier::new(trust.roots);
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(trust.cert_chain, trust.key)?;
    config.resumption = Resumption::disabled();
    config.enable_sni = false;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accept any server certificate that chains to the trusted roots.
///
/// Hostname verification is deliberately absent: the peer was reached
/// through a scoped link-local address and its certificate names nothing
/// resolvable. Chain validation against the supplied roots is the entire
/// trust decision.
#[derive(Debug)]
pub struct ChainTrustVerifier {
    roots: RootCertStore,
    algos: WebPkiSupportedAlgorithms,
}

impl ChainTrustVerifier {
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            roots,
            algos: default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for ChainTrustVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algos.all,
        )?;
        // No verify_server_name here; the name is not part of the trust
        // decision.
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algos)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algos)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algos.supported_schemes()
    }
}
