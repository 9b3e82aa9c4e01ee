//! Shared GPU resources.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{ClearValue, GpuDevice, GpuVirtualAddress, ResourceDesc};
use crate::error::Result;
use crate::state::ResourceState;
use crate::tracker::GlobalResourceStates;

struct ResourceInner<D: GpuDevice> {
    device: Arc<D>,
    native: D::Resource,
    raw: D::RawResource,
    desc: ResourceDesc,
    clear_value: Option<ClearValue>,
    name: Mutex<String>,
    global_states: Arc<GlobalResourceStates<D::RawResource>>,
}

impl<D: GpuDevice> Drop for ResourceInner<D> {
    fn drop(&mut self) {
        self.global_states.remove(self.raw);
    }
}

/// A GPU allocation shared between owners.
///
/// Clones alias the same GPU object. The resource is registered in the
/// global state table while any clone is alive.
pub struct Resource<D: GpuDevice> {
    inner: Arc<ResourceInner<D>>,
}

impl<D: GpuDevice> Resource<D> {
    pub(crate) fn new(
        device: Arc<D>,
        global_states: Arc<GlobalResourceStates<D::RawResource>>,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
        name: &str,
    ) -> Result<Self> {
        let native = device
            .create_resource(desc, initial_state, clear_value.as_ref(), name)
            .inspect_err(|e| tracing::error!("Failed to create resource '{name}': {e}"))?;
        let raw = device.raw_resource(&native);
        global_states.add(raw, initial_state, desc.subresource_count());

        Ok(Self {
            inner: Arc::new(ResourceInner {
                device,
                native,
                raw,
                desc: *desc,
                clear_value,
                name: Mutex::new(name.to_string()),
                global_states,
            }),
        })
    }

    /// Description the resource was created with.
    pub fn desc(&self) -> &ResourceDesc {
        &self.inner.desc
    }

    /// State-tracking identity.
    pub fn raw(&self) -> D::RawResource {
        self.inner.raw
    }

    /// Native allocation.
    pub fn native(&self) -> &D::Resource {
        &self.inner.native
    }

    /// GPU address of a buffer, 0 for textures.
    pub fn gpu_address(&self) -> GpuVirtualAddress {
        self.inner.device.resource_gpu_address(&self.inner.native)
    }

    /// Optimized clear value, if any.
    pub fn clear_value(&self) -> Option<ClearValue> {
        self.inner.clear_value
    }

    /// Debug name.
    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    /// Rename the resource, including its native debug name.
    pub fn set_name(&self, name: &str) {
        self.inner.device.set_resource_name(&self.inner.native, name);
        *self.inner.name.lock() = name.to_string();
    }

    /// Returns `true` if both handles alias the same GPU object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<D: GpuDevice> Clone for Resource<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: GpuDevice> fmt::Debug for Resource<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("raw", &self.inner.raw)
            .field("name", &*self.inner.name.lock())
            .field("desc", &self.inner.desc)
            .finish()
    }
}
