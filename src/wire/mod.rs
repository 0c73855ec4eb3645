//! Wire protocol: the 10-byte header, opcode/flag/feature constants, and
//! little-endian payload primitives (`spec.md` §3-§4.1, §4.4, §6).

pub mod codec;
pub mod header;
pub mod opcode;

pub use codec::{Cursor, Writer};
pub use header::{HeaderError, Request};
pub use opcode::Opcode;
