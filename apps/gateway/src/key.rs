//! Host key management.
//!
//! Every supported algorithm keeps its own PEM file next to a configured base
//! path (`<base>_rsa`, `<base>_ed25519`). A missing file is generated once and
//! loaded from disk on every later start.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::info;
use pem::Pem;
use rand_core::{OsRng, RngCore};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use russh_keys::ssh_key::private::{Ed25519Keypair, KeypairData, RsaKeypair};
use russh_keys::{HashAlg, PrivateKey};

/// Default modulus size for freshly generated RSA host keys
pub const DEFAULT_RSA_BITS: usize = 4096;

/// Size of an ed25519 key in bits
const ED25519_BITS: usize = 256;

const RSA_PEM_LABEL: &str = "RSA PRIVATE KEY";
const ED25519_PEM_LABEL: &str = "PRIVATE KEY";

#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("failed to read host key '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write host key '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no bytes were read from host key '{0}'")]
    Empty(PathBuf),

    #[error("host key '{path}' is not PEM encoded: {reason}")]
    NotPem { path: PathBuf, reason: String },

    #[error("expected '{expected}' in PEM format, found '{found}'")]
    UnexpectedLabel {
        expected: &'static str,
        found: String,
    },

    #[error("expected PKCS1 or PKCS8 rsa private key: {0}")]
    InvalidRsa(String),

    #[error("expected a 32 byte ed25519 seed, found {0} bytes")]
    InvalidSeed(usize),

    #[error("key size {bits} is not supported for {algorithm}")]
    UnsupportedKeySize {
        algorithm: HostKeyAlgorithm,
        bits: usize,
    },

    #[error("failed to generate {algorithm} key: {reason}")]
    Generate {
        algorithm: HostKeyAlgorithm,
        reason: String,
    },

    #[error("failed to build ssh signer: {0}")]
    Signer(#[from] russh_keys::ssh_key::Error),
}

/// The closed set of algorithms the gateway uses for its own identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    Rsa,
    Ed25519,
}

impl HostKeyAlgorithm {
    /// Algorithms loaded when the caller does not pick any.
    pub const DEFAULTS: [HostKeyAlgorithm; 2] = [HostKeyAlgorithm::Rsa, HostKeyAlgorithm::Ed25519];

    pub fn tag(self) -> &'static str {
        match self {
            HostKeyAlgorithm::Rsa => "rsa",
            HostKeyAlgorithm::Ed25519 => "ed25519",
        }
    }

    /// Path of the key file for this algorithm, i.e. `<base>_<tag>`.
    pub fn key_path(self, base: &Path) -> PathBuf {
        let mut path = OsString::from(base.as_os_str());
        path.push("_");
        path.push(self.tag());
        PathBuf::from(path)
    }
}

impl fmt::Display for HostKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// RSA host key, stored as PKCS#1.
#[derive(Clone)]
pub struct RsaHostKey {
    key: RsaPrivateKey,
}

impl RsaHostKey {
    pub fn generate(bits: Option<usize>) -> Result<Self, HostKeyError> {
        let bits = bits.unwrap_or(DEFAULT_RSA_BITS);
        let key = RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| HostKeyError::Generate {
            algorithm: HostKeyAlgorithm::Rsa,
            reason: e.to_string(),
        })?;
        Ok(Self { key })
    }

    pub fn marshal_pem(&self) -> Result<Pem, HostKeyError> {
        let der = self.key.to_pkcs1_der().map_err(|e| HostKeyError::Generate {
            algorithm: HostKeyAlgorithm::Rsa,
            reason: e.to_string(),
        })?;
        Ok(Pem::new(RSA_PEM_LABEL, der.as_bytes().to_vec()))
    }

    pub fn unmarshal_pem(block: &Pem) -> Result<Self, HostKeyError> {
        expect_label(block, RSA_PEM_LABEL)?;

        let key = match RsaPrivateKey::from_pkcs1_der(block.contents()) {
            Ok(key) => key,
            Err(_) => RsaPrivateKey::from_pkcs8_der(block.contents())
                .map_err(|e| HostKeyError::InvalidRsa(e.to_string()))?,
        };
        Ok(Self { key })
    }

    pub fn signer(&self) -> Result<PrivateKey, HostKeyError> {
        let keypair = RsaKeypair::try_from(&self.key)?;
        Ok(PrivateKey::new(KeypairData::from(keypair), "")?)
    }
}

/// Ed25519 host key, stored as its raw 32 byte seed.
#[derive(Clone)]
pub struct Ed25519HostKey {
    keypair: Ed25519Keypair,
}

impl Ed25519HostKey {
    pub fn generate(bits: Option<usize>) -> Result<Self, HostKeyError> {
        if let Some(bits) = bits.filter(|&b| b != ED25519_BITS) {
            return Err(HostKeyError::UnsupportedKeySize {
                algorithm: HostKeyAlgorithm::Ed25519,
                bits,
            });
        }

        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Ok(Self {
            keypair: Ed25519Keypair::from_seed(&seed),
        })
    }

    pub fn marshal_pem(&self) -> Result<Pem, HostKeyError> {
        Ok(Pem::new(
            ED25519_PEM_LABEL,
            self.keypair.private.to_bytes().to_vec(),
        ))
    }

    pub fn unmarshal_pem(block: &Pem) -> Result<Self, HostKeyError> {
        expect_label(block, ED25519_PEM_LABEL)?;

        let seed: [u8; 32] = block
            .contents()
            .try_into()
            .map_err(|_| HostKeyError::InvalidSeed(block.contents().len()))?;
        Ok(Self {
            keypair: Ed25519Keypair::from_seed(&seed),
        })
    }

    pub fn signer(&self) -> Result<PrivateKey, HostKeyError> {
        Ok(PrivateKey::new(KeypairData::from(self.keypair.clone()), "")?)
    }
}

/// A host key of any supported algorithm.
#[derive(Clone)]
pub enum HostKey {
    Rsa(RsaHostKey),
    Ed25519(Ed25519HostKey),
}

impl HostKey {
    /// Generate a new key. `bits` of `None` picks the algorithm default.
    pub fn generate(algorithm: HostKeyAlgorithm, bits: Option<usize>) -> Result<Self, HostKeyError> {
        Ok(match algorithm {
            HostKeyAlgorithm::Rsa => HostKey::Rsa(RsaHostKey::generate(bits)?),
            HostKeyAlgorithm::Ed25519 => HostKey::Ed25519(Ed25519HostKey::generate(bits)?),
        })
    }

    pub fn algorithm(&self) -> HostKeyAlgorithm {
        match self {
            HostKey::Rsa(_) => HostKeyAlgorithm::Rsa,
            HostKey::Ed25519(_) => HostKeyAlgorithm::Ed25519,
        }
    }

    pub fn marshal_pem(&self) -> Result<Pem, HostKeyError> {
        match self {
            HostKey::Rsa(key) => key.marshal_pem(),
            HostKey::Ed25519(key) => key.marshal_pem(),
        }
    }

    /// Decode a PEM block that is expected to hold a key of `algorithm`.
    pub fn unmarshal_pem(algorithm: HostKeyAlgorithm, block: &Pem) -> Result<Self, HostKeyError> {
        Ok(match algorithm {
            HostKeyAlgorithm::Rsa => HostKey::Rsa(RsaHostKey::unmarshal_pem(block)?),
            HostKeyAlgorithm::Ed25519 => HostKey::Ed25519(Ed25519HostKey::unmarshal_pem(block)?),
        })
    }

    /// The key in the form the SSH server signs with.
    pub fn signer(&self) -> Result<PrivateKey, HostKeyError> {
        match self {
            HostKey::Rsa(key) => key.signer(),
            HostKey::Ed25519(key) => key.signer(),
        }
    }
}

fn expect_label(block: &Pem, expected: &'static str) -> Result<(), HostKeyError> {
    if block.tag() != expected {
        return Err(HostKeyError::UnexpectedLabel {
            expected,
            found: block.tag().to_string(),
        });
    }
    Ok(())
}

/// Load the host key stored at `path`, generating and persisting a new one if the file is missing.
///
/// An existing file is assumed to hold a key of `algorithm`; anything else is an error.
pub fn read_or_make_host_key(path: &Path, algorithm: HostKeyAlgorithm) -> Result<PrivateKey, HostKeyError> {
    match fs::symlink_metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => make_host_key(path, algorithm)?,
        Err(source) => {
            return Err(HostKeyError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let key = load_host_key(path, algorithm)?;
    let signer = key.signer()?;
    info!(
        "Host key ({}) fingerprint: {}",
        algorithm,
        signer.public_key().fingerprint(HashAlg::Sha256)
    );
    Ok(signer)
}

/// Load or create one host key per algorithm, each at `<base>_<algorithm>`.
pub fn read_or_make_host_keys(
    base: &Path,
    algorithms: &[HostKeyAlgorithm],
) -> Result<Vec<PrivateKey>, HostKeyError> {
    algorithms
        .iter()
        .map(|&algorithm| read_or_make_host_key(&algorithm.key_path(base), algorithm))
        .collect()
}

fn load_host_key(path: &Path, algorithm: HostKeyAlgorithm) -> Result<HostKey, HostKeyError> {
    info!("Loading host key (algorithm {}) from {}", algorithm, path.display());

    let bytes = fs::read(path).map_err(|source| HostKeyError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(HostKeyError::Empty(path.to_path_buf()));
    }

    let block = pem::parse(&bytes).map_err(|e| HostKeyError::NotPem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    HostKey::unmarshal_pem(algorithm, &block)
}

fn make_host_key(path: &Path, algorithm: HostKeyAlgorithm) -> Result<(), HostKeyError> {
    info!("Writing new host key (algorithm {}) to {}", algorithm, path.display());

    let key = HostKey::generate(algorithm, None)?;
    let encoded = pem::encode(&key.marshal_pem()?);

    let write_err = |source| HostKeyError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut file = create_private_file(path).map_err(write_err)?;
    file.write_all(encoded.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    Ok(())
}

/// Create a new file readable by the owner only. Never truncates an existing file.
fn create_private_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;
    use tempfile::TempDir;

    #[test]
    fn test_key_path_appends_algorithm() {
        let base = Path::new("/var/lib/gateway/host_key");
        assert_eq!(
            HostKeyAlgorithm::Rsa.key_path(base),
            PathBuf::from("/var/lib/gateway/host_key_rsa")
        );
        assert_eq!(
            HostKeyAlgorithm::Ed25519.key_path(base),
            PathBuf::from("/var/lib/gateway/host_key_ed25519")
        );
    }

    #[test]
    fn test_ed25519_pem_round_trip() {
        let key = HostKey::generate(HostKeyAlgorithm::Ed25519, None).unwrap();
        let block = key.marshal_pem().unwrap();
        assert_eq!(block.tag(), "PRIVATE KEY");
        assert_eq!(block.contents().len(), 32);

        let restored = HostKey::unmarshal_pem(HostKeyAlgorithm::Ed25519, &block).unwrap();
        assert_eq!(
            key.signer().unwrap().public_key(),
            restored.signer().unwrap().public_key()
        );
    }

    #[test]
    fn test_rsa_pem_round_trip() {
        let key = HostKey::generate(HostKeyAlgorithm::Rsa, Some(1024)).unwrap();
        let block = key.marshal_pem().unwrap();
        assert_eq!(block.tag(), "RSA PRIVATE KEY");

        let restored = HostKey::unmarshal_pem(HostKeyAlgorithm::Rsa, &block).unwrap();
        assert_eq!(restored.algorithm(), HostKeyAlgorithm::Rsa);
        assert_eq!(
            key.signer().unwrap().public_key(),
            restored.signer().unwrap().public_key()
        );
    }

    #[test]
    fn test_rsa_accepts_pkcs8_body() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let der = key.to_pkcs8_der().unwrap();
        let block = Pem::new(RSA_PEM_LABEL, der.as_bytes().to_vec());

        let loaded = RsaHostKey::unmarshal_pem(&block).unwrap();
        let expected = RsaHostKey { key };
        assert_eq!(
            loaded.signer().unwrap().public_key(),
            expected.signer().unwrap().public_key()
        );
    }

    #[test]
    fn test_label_mismatch_is_rejected() {
        let ed = HostKey::generate(HostKeyAlgorithm::Ed25519, None).unwrap();
        let block = ed.marshal_pem().unwrap();

        let err = HostKey::unmarshal_pem(HostKeyAlgorithm::Rsa, &block).err().unwrap();
        assert!(matches!(
            err,
            HostKeyError::UnexpectedLabel { expected: "RSA PRIVATE KEY", .. }
        ));
    }

    #[test]
    fn test_ed25519_rejects_bad_seed_and_size() {
        let block = Pem::new(ED25519_PEM_LABEL, vec![0u8; 31]);
        assert!(matches!(
            Ed25519HostKey::unmarshal_pem(&block),
            Err(HostKeyError::InvalidSeed(31))
        ));
        assert!(matches!(
            Ed25519HostKey::generate(Some(512)),
            Err(HostKeyError::UnsupportedKeySize { bits: 512, .. })
        ));
    }

    #[test]
    fn test_read_or_make_generates_then_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("host_key_ed25519");

        let first = read_or_make_host_key(&path, HostKeyAlgorithm::Ed25519).unwrap();
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let second = read_or_make_host_key(&path, HostKeyAlgorithm::Ed25519).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_read_or_make_loads_existing_rsa_key() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("host_key");
        let path = HostKeyAlgorithm::Rsa.key_path(&base);

        let key = HostKey::generate(HostKeyAlgorithm::Rsa, Some(1024)).unwrap();
        fs::write(&path, pem::encode(&key.marshal_pem().unwrap())).unwrap();

        let loaded = read_or_make_host_key(&path, HostKeyAlgorithm::Rsa).unwrap();
        assert_eq!(loaded.public_key(), key.signer().unwrap().public_key());
    }

    #[test]
    fn test_read_or_make_rejects_empty_and_garbage() {
        let dir = TempDir::new().unwrap();

        let empty = dir.path().join("empty_ed25519");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(
            read_or_make_host_key(&empty, HostKeyAlgorithm::Ed25519),
            Err(HostKeyError::Empty(_))
        ));

        let garbage = dir.path().join("garbage_ed25519");
        fs::write(&garbage, b"definitely not a pem file").unwrap();
        assert!(matches!(
            read_or_make_host_key(&garbage, HostKeyAlgorithm::Ed25519),
            Err(HostKeyError::NotPem { .. })
        ));

        // the broken files are left alone rather than regenerated
        assert_eq!(fs::read(&garbage).unwrap(), b"definitely not a pem file");
    }
}
