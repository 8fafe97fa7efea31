use std::path::PathBuf;

use shadow_nexus::certs::ensure_certs_in;

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("nexus_certs_{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

struct DirGuard(PathBuf);

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[test]
fn minting_produces_pem_pair() {
    let dir = temp_dir();
    let _guard = DirGuard(dir.clone());

    let (cert, key) = ensure_certs_in(&dir, "10.20.30.40").unwrap();
    assert!(cert.exists());
    assert!(key.exists());
    let cert_pem = std::fs::read_to_string(&cert).unwrap();
    let key_pem = std::fs::read_to_string(&key).unwrap();
    assert!(cert_pem.contains("BEGIN CERTIFICATE"));
    assert!(key_pem.contains("BEGIN PRIVATE KEY"));
}

#[test]
fn fresh_certificates_are_not_regenerated() {
    let dir = temp_dir();
    let _guard = DirGuard(dir.clone());

    let (cert, _) = ensure_certs_in(&dir, "10.20.30.40").unwrap();
    let first = std::fs::read(&cert).unwrap();
    let (cert, _) = ensure_certs_in(&dir, "10.20.30.40").unwrap();
    let second = std::fs::read(&cert).unwrap();
    assert_eq!(first, second);
}

// Moving the server to a new LAN address re-mints so the SAN list stays
// valid for the advertised IP.
#[test]
fn changed_server_ip_regenerates_the_certificate() {
    let dir = temp_dir();
    let _guard = DirGuard(dir.clone());

    let (cert, _) = ensure_certs_in(&dir, "10.20.30.40").unwrap();
    let first = std::fs::read(&cert).unwrap();

    let (cert, _) = ensure_certs_in(&dir, "192.168.7.7").unwrap();
    let second = std::fs::read(&cert).unwrap();
    assert_ne!(first, second);

    // The new cert satisfies the check for the new address.
    let (cert, _) = ensure_certs_in(&dir, "192.168.7.7").unwrap();
    assert_eq!(second, std::fs::read(&cert).unwrap());
}
