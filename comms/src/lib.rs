mod client;
mod deserialize;
pub mod msg;
pub mod protocol;
mod receiver;
mod sender;
mod serialize;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use client::{PeerClient, unresolvable};
pub use deserialize::Deserialize;
pub use receiver::PipeReceiver;
pub use sender::PipeSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Creates both `PipeReceiver` and `PipeSender` network channel parts.
///
/// Given a reader and a writer creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a pipe receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (PipeReceiver<R>, PipeSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (PipeReceiver::new(rx), PipeSender::new(tx))
}
