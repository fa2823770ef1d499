use crate::config::TlsMaterial;
use crate::error::TlsError;
use rumqttc::{TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;
use tracing::{info, warn};

/// TLS certificate verifier that accepts any certificate (for insecure_skip_verify)
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build the rustls client configuration for the broker connection.
///
/// Roots come from the configured CA, or from the platform store when none is set.
/// A client certificate and key enable mutual TLS and must be given together.
pub fn client_config(material: &TlsMaterial, insecure: bool) -> Result<ClientConfig, TlsError> {
    let builder = if insecure {
        warn!("TLS certificate verification disabled for broker connection");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    } else {
        ClientConfig::builder().with_root_certificates(root_store(material)?)
    };

    match (&material.client_cert, &material.client_key) {
        (Some(cert), Some(key)) => {
            let chain = parse_certificates(cert, "client certificate")?;
            let key = PrivateKeyDer::from_pem_slice(key).map_err(|e| TlsError::Pem {
                what: "private key",
                reason: e.to_string(),
            })?;
            info!("Using client certificate authentication for broker");
            Ok(builder.with_client_auth_cert(chain, key)?)
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TlsError::IncompleteClientAuth),
    }
}

pub fn transport(material: &TlsMaterial, insecure: bool) -> Result<Transport, TlsError> {
    let config = client_config(material, insecure)?;
    Ok(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config))))
}

fn root_store(material: &TlsMaterial) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();

    match &material.ca_cert {
        Some(ca) => {
            for cert in parse_certificates(ca, "CA certificate")? {
                roots.add(cert)?;
            }
        }
        None => {
            let (added, ignored) =
                roots.add_parsable_certificates(rustls_native_certs::load_native_certs()?);
            info!(
                "Loaded {} platform root certificate(s) ({} ignored)",
                added, ignored
            );
        }
    }

    if roots.is_empty() {
        return Err(TlsError::NoRoots);
    }
    Ok(roots)
}

fn parse_certificates(
    pem: &[u8],
    what: &'static str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem {
            what,
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::Pem {
            what,
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}
