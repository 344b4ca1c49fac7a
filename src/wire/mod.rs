/*! Wire format: packet representation and the sequence-number comparator.

Like the rest of the crate's field-access layer, this follows the
`Packet`/`Repr` split: [`Packet`] is a thin, panicking-free view over a byte
slice with field accessors, [`Repr`] is the validated, high-level value
parsed out of (or emitted into) one.
*/

mod packet;
mod sack;
mod seq;

pub use self::packet::{ExtensionIter, Packet, PacketType, Repr, HEADER_LEN};
pub use self::sack::SelectiveAck;
pub use self::seq::SeqNumber;

use core::fmt;

mod field {
    pub type Field = core::ops::Range<usize>;
    pub type Rest = core::ops::RangeFrom<usize>;
}

/// Parsing a packet failed: truncated buffer, bad version, unknown type, or
/// a malformed extension chain. Carries no payload — the caller is expected
/// to drop and count the packet (spec §4.1, §7), not to inspect the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(pub(crate) &'static str);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed µTP packet: {}", self.0)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
