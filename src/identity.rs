use anyhow::{bail, Context, Result};
use rustls::pki_types::CertificateDer;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Extracts the verified client identity (peer certificate's Subject
/// Common Name) from a server-side TLS stream that has already
/// completed its handshake with mandatory client-cert verification.
///
/// A stream with no peer certificate, or a leaf certificate with no CN
/// in its subject, is treated the way spec.md treats a handshake
/// failure: the caller should drop the connection silently.
pub fn client_identity(stream: &TlsStream<TcpStream>) -> Result<String> {
    let (_, session) = stream.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .context("no peer certificate presented")?;

    common_name(leaf)
}

fn common_name(der: &CertificateDer<'_>) -> Result<String> {
    let (_, cert) =
        X509Certificate::from_der(der.as_ref()).context("failed to parse peer certificate")?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .context("peer certificate subject has no Common Name")?
        .as_str()
        .context("peer certificate Common Name is not valid UTF-8")?;

    if cn.is_empty() {
        bail!("peer certificate Common Name is empty");
    }

    Ok(cn.to_owned())
}
