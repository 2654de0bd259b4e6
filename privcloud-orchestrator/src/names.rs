use privcloud_common::{ProvisioningError, ResourceKind};
use privcloud_providers::{CloudProvider, TagFilter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Upper bound on candidates tried per allocation (allowed server limit).
pub const MAX_NAME_ATTEMPTS: u32 = 200;

/// Per-kind name counters, shared by every allocator of one driver.
#[derive(Debug, Default)]
pub struct NameCounters {
    instance: AtomicU64,
    volume: AtomicU64,
}

impl NameCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next suffix for `kind`, starting at 1.
    pub fn next(&self, kind: ResourceKind) -> u64 {
        let counter = match kind {
            ResourceKind::Instance => &self.instance,
            ResourceKind::Volume => &self.volume,
        };
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Collision-checked names against the provider's tag index.
///
/// The check is not atomic with the counter: two drivers sharing a prefix can
/// still pick the same name.
#[derive(Clone)]
pub struct NameAllocator {
    provider: Arc<dyn CloudProvider>,
    counters: Arc<NameCounters>,
    max_attempts: u32,
}

impl NameAllocator {
    pub fn new(provider: Arc<dyn CloudProvider>, counters: Arc<NameCounters>) -> Self {
        Self {
            provider,
            counters,
            max_attempts: MAX_NAME_ATTEMPTS,
        }
    }

    pub async fn allocate(&self, kind: ResourceKind, prefix: &str) -> Result<String, ProvisioningError> {
        for _ in 0..self.max_attempts {
            let candidate = format!("{}{}", prefix, self.counters.next(kind));
            let taken = self
                .provider
                .describe_tags(&TagFilter::value_of_kind(kind, &candidate))
                .await
                .map_err(|e| ProvisioningError::remote("describe_tags", e))?;
            if taken.is_empty() {
                tracing::debug!("[names] allocated {} name {}", kind, candidate);
                return Ok(candidate);
            }
            tracing::debug!("[names] {} name {} already in use", kind, candidate);
        }
        Err(ProvisioningError::NameSpaceExhausted {
            kind,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent_per_kind() {
        let counters = NameCounters::new();
        assert_eq!(counters.next(ResourceKind::Instance), 1);
        assert_eq!(counters.next(ResourceKind::Instance), 2);
        assert_eq!(counters.next(ResourceKind::Volume), 1);
    }
}
