use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that behaves like a full-duplex byte stream: a physical
/// transport carrier, a multiplexed logical stream, or a crypto/compression
/// wrapper layered over either. Every splice endpoint, work-conn, and mux
/// stream in this crate is ultimately boxed to this trait so the engine
/// doesn't care which concrete transport produced it.
pub trait Carrier: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Carrier for T {}

pub type BoxedCarrier = Box<dyn Carrier>;
