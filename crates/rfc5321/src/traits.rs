use tokio::io::{AsyncRead, AsyncWrite};

/// Anything we can speak SMTP over: a plain socket, a TLS stream
/// layered over a socket, or an in-memory duplex in tests.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncReadAndWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;
