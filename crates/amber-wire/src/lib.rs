// Author: Lukas Bower
// Purpose: Provide snapshot wire types and codec primitives for the Amber engine.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Snapshot wire types and codec primitives shared between the Amber
//! checkpoint engine and snapshot consumers. A snapshot is a tagged,
//! length-prefixed record stream: a child list, one record per monitored
//! child, and a side table of byte attachments holding dataspace content.

mod codec;
mod fuzz;
mod types;

pub use codec::{decode_snapshot, encode_snapshot};
pub use fuzz::fuzz_decode;
pub use types::*;
