use crate::config::TlsSettings;
use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Build the server side TLS configuration. Without a configured
/// private key a self-signed certificate for `hostname` is generated,
/// which is enough for opportunistic STARTTLS.
pub fn make_server_config(settings: &TlsSettings) -> anyhow::Result<Arc<ServerConfig>> {
    let hostname = settings.hostname.clone().unwrap_or_else(local_hostname);

    let mut certificates = vec![];
    let private_key = match &settings.private_key {
        Some(path) => PrivateKeyDer::from_pem_file(path)
            .with_context(|| format!("loading private key from {}", path.display()))?,
        None => {
            tracing::info!("no TLS private key configured; generating a self-signed certificate for {hostname}");
            let key = rcgen::generate_simple_self_signed(vec![hostname])?;
            certificates.push(CertificateDer::from_slice(key.cert.der()).into_owned());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(path) = &settings.certificate {
        certificates = CertificateDer::pem_file_iter(path)
            .with_context(|| format!("opening certificates {}", path.display()))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("loading certificates from {}", path.display()))?;
    }
    if certificates.is_empty() {
        anyhow::bail!("no TLS certificates were loaded");
    }

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}
