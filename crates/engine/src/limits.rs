// SPDX-License-Identifier: MIT

//! The Resource-Limit Setter: applies the configured
//! `RLIMIT_*` values once, before any task is started, and logs (never
//! panics on) anything the kernel rejects.

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use sv_core::{ResourceKind, ResourceLimit};

fn resource_for(kind: ResourceKind) -> Resource {
    match kind {
        ResourceKind::AddressSpace => Resource::RLIMIT_AS,
        ResourceKind::Core => Resource::RLIMIT_CORE,
        ResourceKind::Cpu => Resource::RLIMIT_CPU,
        ResourceKind::Data => Resource::RLIMIT_DATA,
        ResourceKind::FileSize => Resource::RLIMIT_FSIZE,
        ResourceKind::OpenFiles => Resource::RLIMIT_NOFILE,
        ResourceKind::Processes => Resource::RLIMIT_NPROC,
        ResourceKind::Stack => Resource::RLIMIT_STACK,
    }
}

/// Apply every limit in `limits`, logging and continuing past any
/// individual failure rather than aborting startup.
pub fn apply_limits(limits: &[ResourceLimit]) {
    for limit in limits {
        let resource = resource_for(limit.kind);
        match setrlimit(resource, limit.cur, limit.max) {
            Ok(()) => match getrlimit(resource) {
                Ok((cur, max)) if cur == limit.cur && max == limit.max => {}
                Ok((cur, max)) => tracing::warn!(
                    kind = ?limit.kind,
                    requested_cur = limit.cur,
                    requested_max = limit.max,
                    effective_cur = cur,
                    effective_max = max,
                    "kernel applied a different limit than requested"
                ),
                Err(e) => tracing::warn!(kind = ?limit.kind, error = %e, "reading back applied limit failed"),
            },
            Err(e) => tracing::warn!(kind = ?limit.kind, error = %e, "setting resource limit failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_named_kind_to_a_distinct_resource() {
        let kinds = [
            ResourceKind::AddressSpace,
            ResourceKind::Core,
            ResourceKind::Cpu,
            ResourceKind::Data,
            ResourceKind::FileSize,
            ResourceKind::OpenFiles,
            ResourceKind::Processes,
            ResourceKind::Stack,
        ];
        let mapped: Vec<Resource> = kinds.iter().map(|k| resource_for(*k)).collect();
        for (i, a) in mapped.iter().enumerate() {
            for (j, b) in mapped.iter().enumerate() {
                if i != j {
                    assert_ne!(*a as i32, *b as i32);
                }
            }
        }
    }

    #[test]
    fn applying_a_harmless_limit_does_not_panic() {
        // Disabling core dumps is a safe no-op limit to exercise the
        // apply/read-back path without risking the test process itself.
        apply_limits(&[ResourceLimit {
            kind: ResourceKind::Core,
            cur: 0,
            max: 0,
        }]);
    }
}
