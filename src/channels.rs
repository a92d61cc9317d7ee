use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub to_bridge: broadcast::Sender<bridge::ChannelData>,
    pub shutdown: broadcast::Sender<()>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            to_bridge: Self::channel(),
            shutdown: Self::channel(),
        }
    }

    /// Tells every task to wind down.
    pub fn shutdown(&self) {
        let _ = self.to_bridge.send(bridge::ChannelData::Shutdown);
        let _ = self.shutdown.send(());
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
