use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("failed to open firmware archive: {0}")]
    ArchiveOpen(#[source] zip::result::ZipError),
    #[error("error reading firmware archive: {0}")]
    ArchiveRead(#[source] zip::result::ZipError),
    #[error("expected meta.conf at the beginning of the archive")]
    MissingManifest,
    #[error("unexpected meta.conf.ed25519 size: {actual}")]
    BadSignatureSize { actual: u64 },
    /// The manifest did not match its detached signature (or the signature
    /// was missing while a public key was supplied). Distinct from
    /// [`ApplyError::ManifestParse`] so tampering can be told apart from
    /// corruption.
    #[error("firmware signature verification failed")]
    SignatureVerify,
    #[error("manifest parse error on line {line}: {msg}")]
    ManifestParse { line: usize, msg: String },
    #[error("no applicable task matches '{0}'")]
    NoApplicableTask(String),
    #[error("archive entry '{0}' is not a resource")]
    BadResourcePath(String),
    #[error("invalid sparse map for '{resource}': {msg}")]
    SparseMapInvalid {
        resource: String,
        msg: &'static str,
    },
    #[error("FAT cache initialization failed: {0}")]
    FatCacheInit(#[source] std::io::Error),
    #[error("{action}: {msg}")]
    Action { action: &'static str, msg: String },
    #[error("content hash mismatch for '{0}'")]
    ResourceHash(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
