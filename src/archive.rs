use std::io::{Read, Seek};
use std::ops::Range;

use zeroize::Zeroizing;
use zip::ZipArchive;

use crate::error::ApplyError;

/// Name of the manifest entry.
pub const MANIFEST_NAME: &str = "meta.conf";
/// Name of the optional detached-signature entry preceding the manifest.
pub const SIGNATURE_NAME: &str = "meta.conf.ed25519";
/// Archive directory holding resource payloads.
const RESOURCE_PREFIX: &str = "data/";

const SIGNATURE_LEN: usize = 64;

/// A firmware update archive.
///
/// The first entry is either the detached manifest signature followed by the
/// manifest, or the manifest directly; both are read up front so the
/// manifest is verified before any payload byte is interpreted. Every
/// remaining entry is a resource payload under `data/`.
pub struct FirmwareArchive<R: Read + Seek> {
    zip: ZipArchive<R>,
    manifest: Vec<u8>,
    signature: Option<Zeroizing<[u8; SIGNATURE_LEN]>>,
    first_resource: usize,
}

impl<R: Read + Seek> FirmwareArchive<R> {
    pub fn open(reader: R) -> Result<Self, ApplyError> {
        let mut zip = ZipArchive::new(reader).map_err(ApplyError::ArchiveOpen)?;
        if zip.len() == 0 {
            return Err(ApplyError::MissingManifest);
        }

        let mut index = 0;
        let mut signature = None;
        {
            let mut entry = zip.by_index(0).map_err(ApplyError::ArchiveRead)?;
            if entry.name() == SIGNATURE_NAME {
                let mut buf = Zeroizing::new(Vec::new());
                entry.read_to_end(&mut buf)?;
                if buf.len() != SIGNATURE_LEN {
                    return Err(ApplyError::BadSignatureSize {
                        actual: buf.len() as u64,
                    });
                }
                let mut sig = Zeroizing::new([0u8; SIGNATURE_LEN]);
                sig.copy_from_slice(&buf);
                signature = Some(sig);
                index = 1;
            }
        }

        if index >= zip.len() {
            return Err(ApplyError::MissingManifest);
        }
        let manifest = {
            let mut entry = zip.by_index(index).map_err(ApplyError::ArchiveRead)?;
            if entry.name() != MANIFEST_NAME {
                return Err(ApplyError::MissingManifest);
            }
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            buf
        };

        Ok(Self {
            zip,
            manifest,
            signature,
            first_resource: index + 1,
        })
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest
    }

    pub fn signature(&self) -> Option<&[u8; SIGNATURE_LEN]> {
        self.signature.as_deref()
    }

    /// Archive indices of the resource entries, in archive order.
    pub fn resource_indices(&self) -> Range<usize> {
        self.first_resource..self.zip.len()
    }

    /// Open the resource entry at `index`, returning its resource id and a
    /// reader over the (decompressed) payload.
    pub fn resource_entry(
        &mut self,
        index: usize,
    ) -> Result<(String, impl Read + '_), ApplyError> {
        let entry = self.zip.by_index(index).map_err(ApplyError::ArchiveRead)?;
        let id = path_to_resource(entry.name())
            .ok_or_else(|| ApplyError::BadResourcePath(entry.name().to_string()))?
            .to_string();
        Ok((id, entry))
    }
}

/// Map an archive path to its resource identifier (`data/<id>` -> `<id>`).
pub fn path_to_resource(path: &str) -> Option<&str> {
    let id = path.strip_prefix(RESOURCE_PREFIX)?;
    if id.is_empty() || id.ends_with('/') {
        return None;
    }
    Some(id)
}
