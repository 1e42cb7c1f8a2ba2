//! Team to storage container naming.

use md5::{Digest, Md5};

/// Storage container name for a team: the lowercase hex MD5 of the raw team ID.
///
/// MD5 serves only as a stable fingerprint here. It keeps the raw team ID out of
/// backend-visible names, and lowercase hex is a legal bucket/directory name on
/// every supported backend.
pub fn container_name(team_id: &str) -> String {
    hex::encode(Md5::digest(team_id.as_bytes()))
}
