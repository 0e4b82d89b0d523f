//! Channel builder

use std::sync::Arc;
use std::time::Duration;

use castlink_core::DEFAULT_PORT;

use crate::channel::{Channel, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{ChannelError, Result};
use crate::listener::{ChannelListener, NullListener};

/// Builder for [`Channel`].
pub struct ChannelBuilder {
    host: String,
    port: u16,
    remote_name: Option<String>,
    sender_id: String,
    request_timeout: Duration,
    listener: Arc<dyn ChannelListener>,
}

impl ChannelBuilder {
    /// Create a new builder targeting `host`.
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: DEFAULT_PORT,
            remote_name: None,
            sender_id: "sender-0".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            listener: Arc::new(NullListener),
        }
    }

    /// Set the device control port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the display label used for the remote party in logging.
    /// Defaults to the host.
    pub fn remote_name(mut self, remote_name: &str) -> Self {
        self.remote_name = Some(remote_name.to_string());
        self
    }

    /// Set the sender identity carried in every envelope this channel
    /// emits.
    pub fn sender_id(mut self, sender_id: &str) -> Self {
        self.sender_id = sender_id.to_string();
        self
    }

    /// Set how long to wait until a request is answered.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the listener bundle.
    pub fn listener(mut self, listener: Arc<dyn ChannelListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Build without connecting.
    pub fn build(self) -> Result<Channel> {
        if self.host.trim().is_empty() {
            return Err(ChannelError::Config("host cannot be blank".to_string()));
        }
        if self.sender_id.trim().is_empty() {
            return Err(ChannelError::Config(
                "sender id cannot be blank".to_string(),
            ));
        }
        let remote_name = self.remote_name.unwrap_or_else(|| self.host.clone());
        if remote_name.trim().is_empty() {
            return Err(ChannelError::Config(
                "remote name cannot be blank".to_string(),
            ));
        }

        Ok(Channel::new(
            self.host,
            self.port,
            remote_name,
            self.sender_id,
            self.request_timeout,
            self.listener,
        ))
    }

    /// Build and connect.
    pub async fn connect(self) -> Result<Channel> {
        let channel = self.build()?;
        channel.connect().await?;
        Ok(channel)
    }
}
