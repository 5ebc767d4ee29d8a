//! Decoding of app-registry manifest blobs
//!
//! Blobs are gzip streams, usually base64 encoded on the wire.

use super::model::OperatorManifest;
use super::parser::parse_document;
use super::ManifestError;
use base64::Engine;
use flate2::read::GzDecoder;
use std::io::Read;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decode a downloaded blob into a manifest document
pub fn decode_blob(blob: &[u8]) -> Result<OperatorManifest, ManifestError> {
    let compressed = if blob.starts_with(&GZIP_MAGIC) {
        blob.to_vec()
    } else {
        let text: Vec<u8> = blob.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| ManifestError::InvalidBlob(format!("base64: {}", e)))?
    };

    let mut yaml = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut yaml)
        .map_err(|e| ManifestError::InvalidBlob(format!("gzip: {}", e)))?;

    parse_document(&yaml)
}

/// Encode a manifest document the way registries serve it
#[cfg(test)]
pub(crate) fn encode_blob(manifest: &OperatorManifest) -> Result<Vec<u8>, ManifestError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let yaml = serde_yaml::to_string(manifest).map_err(|e| ManifestError::yaml("manifest", e))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(yaml.as_bytes())
        .and_then(|_| encoder.finish())
        .map(|gz| base64::engine::general_purpose::STANDARD.encode(gz).into_bytes())
        .map_err(|e| ManifestError::InvalidBlob(format!("gzip: {}", e)))
}
