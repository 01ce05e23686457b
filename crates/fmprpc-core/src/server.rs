//! Server handle.

use crate::error::Result;
use crate::protocol::{Protocol, WrapErrorFunc};
use crate::transport::Transport;

/// Serves registered protocols on one transport.
#[derive(Debug, Clone)]
pub struct Server {
    transport: Transport,
}

impl Server {
    /// Binds to `transport` and starts its receive loop. `wrap_error` maps
    /// handler errors for protocols that do not bring their own wrapper.
    pub fn new(transport: &Transport, wrap_error: Option<WrapErrorFunc>) -> Self {
        if let Some(wrap) = wrap_error {
            transport.set_wrap_error(wrap);
        }
        transport.start_receiving();
        Self {
            transport: transport.clone(),
        }
    }

    pub fn register(&self, protocol: Protocol) -> Result<()> {
        self.transport.register_protocol(protocol)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}
