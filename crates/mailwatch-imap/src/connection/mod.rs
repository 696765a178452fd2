//! Connection transport and framing.

pub mod framed;
pub mod stream;

pub use framed::FramedStream;
pub use stream::{MailStream, connect_plain, connect_tls};
