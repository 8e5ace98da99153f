// Author: Lukas Bower
// Purpose: Provide a fuzz corpus harness for snapshot stream decoding.

//! Fuzz corpus harnesses for snapshot stream decoding.

use crate::codec::decode_snapshot;

/// Exercise decoder paths on arbitrary corpus bytes.
pub fn fuzz_decode(bytes: &[u8]) {
    let _ = decode_snapshot(bytes);
}
