//! Deterministic GPU naming
//!
//! Producers usually create GPUs with only a `generateName` prefix. The server
//! derives the final name from the node and the hardware UUID so that the same
//! physical device always maps onto the same object, no matter how many times
//! it is re-announced.

use sha2::Digest;
use sha2::Sha256;

use crate::gpu::Gpu;

/// Number of hex digits of the digest appended to the prefix
pub const CANONICAL_SUFFIX_LEN: usize = 12;

/// Derives `generate_name + first-12-hex(sha256(lower(node) + "/" + lower(id)))`.
pub fn canonical_name(generate_name: &str, node_name: &str, id: &str) -> String {
    format!("{generate_name}{}", canonical_suffix(node_name, id))
}

/// The hex suffix shared by every name derived for `(node_name, id)`.
pub fn canonical_suffix(node_name: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_name.to_lowercase().as_bytes());
    hasher.update(b"/");
    hasher.update(id.to_lowercase().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..CANONICAL_SUFFIX_LEN].to_string()
}

/// Fills in `metadata.name` from `generateName`, `spec.nodeName` and `spec.uuid`.
///
/// A GPU that already has a name is left untouched, as is one that lacks the
/// inputs for derivation; validation reports those.
pub fn ensure_name(gpu: &mut Gpu) {
    if !gpu.metadata.name.is_empty()
        || gpu.metadata.generate_name.is_empty()
        || gpu.spec.node_name.is_empty()
        || gpu.spec.uuid.is_empty()
    {
        return;
    }
    gpu.metadata.name = canonical_name(
        &gpu.metadata.generate_name,
        &gpu.spec.node_name,
        &gpu.spec.uuid,
    );
}
