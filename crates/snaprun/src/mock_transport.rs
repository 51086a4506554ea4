//! Mock transports for testing.
//!
//! These are used internally by the test suite and are not part of the
//! public API. The production `ChannelTransport` already covers the happy
//! path; the mocks here misbehave on purpose.

use crate::transport;
use crate::transport::Transport;

/// A transport whose recv fails immediately with an I/O error.
pub struct FailingTransport;

#[async_trait::async_trait]
impl Transport for FailingTransport {
    async fn send(&self, _payload: &[u8]) -> transport::Result<()> {
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Err(transport::Error::Io("wire fault".into()))
    }

    async fn close(&self) {}
}

/// A transport that swallows everything and never yields a message.
pub struct BlackHoleTransport;

#[async_trait::async_trait]
impl Transport for BlackHoleTransport {
    async fn send(&self, _payload: &[u8]) -> transport::Result<()> {
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        std::future::pending().await
    }

    async fn close(&self) {}
}
