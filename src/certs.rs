use std::net::IpAddr;
use std::path::{Path, PathBuf};

use base64::Engine;
use rcgen::{CertificateParams, DnType, KeyPair, SanType};

/// Make sure `cert.pem`/`key.pem` exist next to the binary and cover the
/// configured address. Returns the two paths for Rocket's TLS config.
///
/// The certificate is re-minted when the configured IP is absent from the
/// existing one (e.g. the machine moved to a new LAN address).
pub fn ensure_certs(server_ip: &str) -> Result<(PathBuf, PathBuf), String> {
    ensure_certs_in(Path::new("."), server_ip)
}

pub fn ensure_certs_in(dir: &Path, server_ip: &str) -> Result<(PathBuf, PathBuf), String> {
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let needs_mint = !cert_path.exists()
        || !key_path.exists()
        || !cert_mentions(&cert_path, server_ip);
    if needs_mint {
        println!("🔐 Generating self-signed certificate for {server_ip}...");
        let (cert_pem, key_pem) = mint(server_ip)?;
        std::fs::write(&cert_path, cert_pem).map_err(|e| format!("write cert: {e}"))?;
        std::fs::write(&key_path, key_pem).map_err(|e| format!("write key: {e}"))?;
    }
    Ok((cert_path, key_path))
}

/// Self-signed certificate covering every way a LAN client reaches the hub:
/// `localhost`, loopback, the wildcard bind address, and the configured IP.
/// Returns (cert, key) PEM strings.
fn mint(server_ip: &str) -> Result<(String, String), String> {
    let key = KeyPair::generate().map_err(|e| e.to_string())?;

    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| e.to_string())?;
    params
        .distinguished_name
        .push(DnType::CommonName, server_ip);

    let mut sans = vec![SanType::DnsName(
        "localhost".try_into().map_err(|e| format!("{e}"))?,
    )];
    for ip in ["127.0.0.1", "0.0.0.0"] {
        sans.push(SanType::IpAddress(
            ip.parse().map_err(|_| "bad address".to_string())?,
        ));
    }
    if let Ok(ip) = server_ip.parse::<IpAddr>() {
        sans.push(SanType::IpAddress(ip));
    }
    if server_ip != "localhost" {
        // The textual form too: IP SANs are raw octets in DER, and the
        // regeneration check byte-searches for the configured address.
        sans.push(SanType::DnsName(
            server_ip.try_into().map_err(|e| format!("{e}"))?,
        ));
    }
    params.subject_alt_names = sans;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365);

    let cert = params.self_signed(&key).map_err(|e| e.to_string())?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Does the PEM certificate at `path` mention `needle`? DNS names sit in the
/// DER as raw ASCII, so a byte search on the decoded body is enough.
fn cert_mentions(path: &Path, needle: &str) -> bool {
    let Ok(pem) = std::fs::read_to_string(path) else {
        return false;
    };
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let Ok(der) = base64::engine::general_purpose::STANDARD.decode(body.as_bytes()) else {
        return false;
    };
    der.windows(needle.len()).any(|w| w == needle.as_bytes())
}
