use std::io;

/// Writes a frame body into `buf`.
///
/// Implementors may return a trailing slice that is written right after `buf`
/// without copying it.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
