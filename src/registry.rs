use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::channel::Channel;

/// Lookup table from channel id to live channel, owned by whoever owns the
/// capture session. Ids are allocated here so they are unique per registry.
pub struct ChannelRegistry {
    next_id: AtomicU32,
    channels: RwLock<HashMap<u32, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn alloc_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add(&self, ch: Arc<Channel>) {
        let mut map = self.channels.write().unwrap_or_else(|e| e.into_inner());
        map.insert(ch.id(), ch);
    }

    pub fn get(&self, id: u32) -> Option<Arc<Channel>> {
        let map = self.channels.read().unwrap_or_else(|e| e.into_inner());
        map.get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Channel>> {
        let mut map = self.channels.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&id)
    }

    pub fn clear(&self) -> Vec<Arc<Channel>> {
        let mut map = self.channels.write().unwrap_or_else(|e| e.into_inner());
        map.drain().map(|(_, ch)| ch).collect()
    }

    pub fn len(&self) -> usize {
        let map = self.channels.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::bundle::BundleAttr;
    use crate::frame::NullReleaser;

    use super::*;

    #[tokio::test]
    async fn ids_are_unique_and_lookup_works() -> anyhow::Result<()> {
        let reg = ChannelRegistry::new();
        let a = reg.alloc_id();
        let b = reg.alloc_id();
        assert_ne!(a, b);

        let attr = BundleAttr {
            streams: vec![1],
            ..BundleAttr::default()
        };
        let ch = Arc::new(Channel::new(
            a,
            attr,
            Arc::new(NullReleaser),
            Box::new(|_| {}),
        ));
        reg.add(ch);

        assert_eq!(reg.get(a).map(|c| c.id()), Some(a));
        assert!(reg.get(b).is_none());

        let removed = reg.remove(a).ok_or_else(|| anyhow::anyhow!("missing"))?;
        removed.stop().await?;
        assert!(reg.is_empty());
        Ok(())
    }
}
