use super::{ComputeError, ContextLimits, Result};

/// Number of thread-groups of `group_size` needed to cover `threads`.
///
/// Rounds up, so a partial trailing group is still launched.
pub fn group_count(threads: u32, group_size: u32) -> u32 {
    debug_assert!(group_size > 0);
    ((group_size as u64 - 1 + threads as u64) / group_size as u64) as u32
}

/// Resolved shape of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGrid {
    pub groups: [u32; 3],
    pub group_size: [u32; 3],
}

impl DispatchGrid {
    /// Splits `threads` into groups, checking the shape against `limits`.
    pub fn new(threads: [u32; 3], group_size: [u32; 3], limits: &ContextLimits) -> Result<Self> {
        if group_size.iter().any(|&s| s == 0) {
            return Err(ComputeError::invalid(format!(
                "group size {:?} has a zero axis",
                group_size
            )));
        }

        for axis in 0..3 {
            if group_size[axis] > limits.max_workgroup_size[axis] {
                return Err(ComputeError::invalid(format!(
                    "group size {:?} exceeds device maximum {:?}",
                    group_size, limits.max_workgroup_size
                )));
            }
        }

        let invocations = group_size.iter().map(|&s| s as u64).product::<u64>();
        if invocations > limits.max_workgroup_invocations as u64 {
            return Err(ComputeError::invalid(format!(
                "group size {:?} has {} invocations, device allows {}",
                group_size, invocations, limits.max_workgroup_invocations
            )));
        }

        let groups = [
            group_count(threads[0], group_size[0]),
            group_count(threads[1], group_size[1]),
            group_count(threads[2], group_size[2]),
        ];

        for axis in 0..3 {
            if groups[axis] > limits.max_workgroup_count[axis] {
                return Err(ComputeError::invalid(format!(
                    "{:?} groups exceeds device maximum {:?}",
                    groups, limits.max_workgroup_count
                )));
            }
        }

        Ok(Self { groups, group_size })
    }

    /// True when no invocation would run.
    pub fn is_empty(&self) -> bool {
        self.groups.iter().any(|&g| g == 0)
    }

    pub fn total_invocations(&self) -> u64 {
        self.groups
            .iter()
            .zip(self.group_size.iter())
            .map(|(&g, &s)| g as u64 * s as u64)
            .product()
    }
}
