// Command recording pools
//
// Each thread that records GPU work gets its own set of command pools, one
// per distinct queue family. Vulkan pools are externally synchronized, so a
// pool is only ever touched by the thread that created it. The registry that
// hands them out is owned by the device and guarded by a single lock.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::device::QueueFamilyIndices;
use super::error::{RenderResult, VkResultExt};

/// Which hardware queue a piece of work targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer];

    fn index(self) -> usize {
        match self {
            QueueKind::Graphics => 0,
            QueueKind::Compute => 1,
            QueueKind::Transfer => 2,
        }
    }
}

/// Per-thread recording pools.
///
/// A command buffer may only be submitted to a queue of the family its pool
/// was created for, so kinds that share a family share a pool and every
/// other kind gets its own.
pub struct ThreadCommandPool {
    families: QueueFamilyIndices,
    pools: Vec<(u32, vk::CommandPool)>,
    by_kind: [usize; 3],
    owner: ThreadId,
}

impl ThreadCommandPool {
    pub fn new(device: &ash::Device, families: QueueFamilyIndices) -> RenderResult<Self> {
        let pool = Self::create_with(
            families,
            |family| {
                let info = vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
                unsafe { device.create_command_pool(&info, None) }.vk_context("vkCreateCommandPool")
            },
            |pool| unsafe { device.destroy_command_pool(pool, None) },
        )?;

        log::debug!(
            "Created {} command pool(s) for thread {:?}",
            pool.pools.len(),
            pool.owner
        );
        Ok(pool)
    }

    /// Build the pool set with `create`, one call per distinct family. On
    /// failure every pool already created is handed to `destroy`.
    fn create_with<E>(
        families: QueueFamilyIndices,
        mut create: impl FnMut(u32) -> Result<vk::CommandPool, E>,
        mut destroy: impl FnMut(vk::CommandPool),
    ) -> Result<Self, E> {
        let mut pools: Vec<(u32, vk::CommandPool)> = Vec::with_capacity(QueueKind::ALL.len());
        let mut by_kind = [0; 3];

        for kind in QueueKind::ALL {
            let family = families.family(kind);
            let index = match pools.iter().position(|&(f, _)| f == family) {
                Some(index) => index,
                None => match create(family) {
                    Ok(pool) => {
                        pools.push((family, pool));
                        pools.len() - 1
                    }
                    Err(e) => {
                        for (_, pool) in pools {
                            destroy(pool);
                        }
                        return Err(e);
                    }
                },
            };
            by_kind[kind.index()] = index;
        }

        Ok(Self {
            families,
            pools,
            by_kind,
            owner: thread::current().id(),
        })
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Pool to allocate from for work submitted on `kind`'s queue.
    pub fn pool_for(&self, kind: QueueKind) -> vk::CommandPool {
        self.pools[self.by_kind[kind.index()]].1
    }

    /// Queue family the pool for `kind` was created for.
    pub fn pool_family(&self, kind: QueueKind) -> u32 {
        self.pools[self.by_kind[kind.index()]].0
    }

    pub fn families(&self) -> QueueFamilyIndices {
        self.families
    }

    pub fn destroy(&self, device: &ash::Device) {
        for &(_, pool) in &self.pools {
            unsafe { device.destroy_command_pool(pool, None) };
        }
    }
}

/// Explicit thread-identity -> pool map.
///
/// Entries are created on first use and kept until [`drain`](Self::drain) at
/// device teardown.
pub struct ThreadRegistry<P> {
    entries: Mutex<HashMap<ThreadId, Arc<P>>>,
}

impl<P> Default for ThreadRegistry<P> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<P> ThreadRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the calling thread's entry, creating it with `create` on first use.
    ///
    /// `create` runs without the registry lock held. Only the calling thread
    /// can insert under its own id, so there is no race on the key.
    pub fn get_or_create<E>(&self, create: impl FnOnce() -> Result<P, E>) -> Result<Arc<P>, E> {
        let id = thread::current().id();
        if let Some(existing) = self.entries.lock().get(&id) {
            return Ok(existing.clone());
        }

        let created = Arc::new(create()?);
        let mut entries = self.entries.lock();
        Ok(entries.entry(id).or_insert(created).clone())
    }

    pub fn current(&self) -> Option<Arc<P>> {
        self.entries.lock().get(&thread::current().id()).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Take every entry out of the registry.
    pub fn drain(&self) -> Vec<Arc<P>> {
        self.entries.lock().drain().map(|(_, p)| p).collect()
    }
}
