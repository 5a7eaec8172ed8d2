use crate::config::TlsMode;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, KeyLog, RootCertStore, SignatureScheme};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// TLS client config shared by every agent, `None` for plain TCP.
pub fn client_config(mode: &TlsMode, key_log: Option<&Path>) -> Result<Option<Arc<ClientConfig>>> {
    let mut config = match mode {
        TlsMode::Disabled => {
            if key_log.is_some() {
                warn!("TLS is disabled, ignoring key log file");
            }
            return Ok(None);
        }
        TlsMode::Verified => ClientConfig::builder()
            .with_root_certificates(native_roots()?)
            .with_no_client_auth(),
        TlsMode::Insecure => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
    };

    if let Some(path) = key_log {
        config.key_log = Arc::new(NssKeyLog::open(path)?);
        info!(filename = %path.display(), "write TLS master secrets in NSS key log format");
    }

    Ok(Some(Arc::new(config)))
}

fn native_roots() -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| Error::Tls(format!("cannot load native root certificates: {}", e)))?;
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if roots.is_empty() {
        return Err(Error::Tls("no usable root certificates found".to_string()));
    }
    Ok(roots)
}

/// Appends TLS secrets in NSS key log format, for decrypting captures.
pub struct NssKeyLog {
    file: Mutex<File>,
}

impl NssKeyLog {
    pub fn open(path: &Path) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path).map_err(|e| Error::io(path, e))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl std::fmt::Debug for NssKeyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NssKeyLog").finish_non_exhaustive()
    }
}

fn nss_line(label: &str, client_random: &[u8], secret: &[u8]) -> String {
    let mut line = String::with_capacity(label.len() + 2 * (client_random.len() + secret.len()) + 3);
    line.push_str(label);
    line.push(' ');
    for b in client_random {
        let _ = write!(line, "{:02x}", b);
    }
    line.push(' ');
    for b in secret {
        let _ = write!(line, "{:02x}", b);
    }
    line.push('\n');
    line
}

impl KeyLog for NssKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = nss_line(label, client_random, secret);
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            warn!(error = %e, "failed to write TLS key log");
        }
    }
}

/// Verifier for `--insecure`: accepts any certificate for any host
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
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nss_line_format() {
        let line = nss_line("CLIENT_RANDOM", &[0x01, 0xab], &[0xff, 0x00, 0x10]);
        assert_eq!(line, "CLIENT_RANDOM 01ab ff0010\n");
    }

    #[test]
    fn key_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.log");

        let log = NssKeyLog::open(&path).unwrap();
        log.log("CLIENT_RANDOM", &[1], &[2]);
        log.log("SERVER_TRAFFIC_SECRET_0", &[3], &[4]);
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "CLIENT_RANDOM 01 02\nSERVER_TRAFFIC_SECRET_0 03 04\n"
        );
    }

    #[test]
    fn unwritable_key_log_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("keys.log");
        assert!(matches!(NssKeyLog::open(&path), Err(Error::Io { .. })));
    }

    #[test]
    fn plain_transport_has_no_tls_config() {
        assert!(client_config(&TlsMode::Disabled, None).unwrap().is_none());
    }

    #[test]
    fn insecure_config_builds_without_roots() {
        let config = client_config(&TlsMode::Insecure, None).unwrap();
        assert!(config.is_some());
    }
}
