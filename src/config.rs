//! Configuration of the virtual memory manager.
//!
//! The [`VmConfigBuilder`] provides an interface for configuring the memory
//! manager before it is constructed: the size of the frame pool and of the
//! swap device, and the layout of the user address space.
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
};

/// The user address space ends here; addresses at or above belong to the
/// kernel (pml4 index 256 and above).
pub const USER_TOP: usize = 0x0000_8000_0000_0000;

/// Default top of the user stack. The first stack page lies right below it.
pub const USER_STACK_TOP: usize = 0x4748_0000;

const DEFAULT_STACK_TOP: Va = match Va::new(USER_STACK_TOP) {
    Some(va) => va,
    None => panic!("non-canonical stack top"),
};

/// Validated settings of a [`VmManager`].
///
/// [`VmManager`]: crate::VmManager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames in the frame pool.
    pub frames: usize,
    /// Number of page-sized slots in the swap device.
    pub swap_slots: usize,
    /// Top of the user stack (exclusive), page aligned.
    pub stack_top: Va,
    /// Maximum number of pages the stack may grow to.
    pub max_stack_pages: usize,
    /// How far below the recorded stack pointer an access may be and still
    /// count as a stack access, in bytes.
    pub stack_slack: usize,
    /// End of the user address space (exclusive).
    pub user_top: usize,
}

impl VmConfig {
    /// Starts building a configuration from the defaults.
    pub fn builder() -> VmConfigBuilder {
        VmConfigBuilder::new()
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            frames: 256,
            swap_slots: 1024,
            stack_top: DEFAULT_STACK_TOP,
            max_stack_pages: 256,
            stack_slack: 32,
            user_top: USER_TOP,
        }
    }
}

/// A builder for [`VmConfig`].
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl Default for VmConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmConfigBuilder {
    /// Creates a builder holding the default configuration.
    pub fn new() -> Self {
        Self {
            config: VmConfig::default(),
        }
    }

    /// Sets the number of physical frames.
    pub fn frames(mut self, frames: usize) -> Self {
        self.config.frames = frames;
        self
    }

    /// Sets the number of swap slots.
    pub fn swap_slots(mut self, slots: usize) -> Self {
        self.config.swap_slots = slots;
        self
    }

    /// Sets the top of the user stack.
    pub fn stack_top(mut self, top: Va) -> Self {
        self.config.stack_top = top;
        self
    }

    /// Sets the maximum stack size, in pages.
    pub fn max_stack_pages(mut self, pages: usize) -> Self {
        self.config.max_stack_pages = pages;
        self
    }

    /// Sets how far below the stack pointer a stack access may land.
    pub fn stack_slack(mut self, bytes: usize) -> Self {
        self.config.stack_slack = bytes;
        self
    }

    /// Sets the end of the user address space.
    pub fn user_top(mut self, top: usize) -> Self {
        self.config.user_top = top;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if the pool is empty, if the
    ///   stack top is unaligned or outside of the user address space, or if
    ///   the maximum stack would reach the null page.
    pub fn build(self) -> Result<VmConfig, KernelError> {
        let VmConfig {
            frames,
            stack_top,
            max_stack_pages,
            user_top,
            ..
        } = self.config;
        let top = stack_top.into_usize();
        if frames == 0
            || stack_top.offset() != 0
            || top > user_top
            || user_top > USER_TOP
            || max_stack_pages == 0
            || max_stack_pages
                .checked_mul(PAGE_SIZE)
                .is_none_or(|size| size >= top)
        {
            Err(KernelError::InvalidArgument)
        } else {
            Ok(self.config)
        }
    }
}
