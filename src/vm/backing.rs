//! Backing descriptors: where the content of a page comes from.
use crate::{KernelError, addressing::PAGE_SIZE, fs::RegularFile, mm::Page, vm::swap::SlotId};

/// Describes how to (re)produce the content of a virtual page.
///
/// Exactly one variant is active for a page at a time. Eviction turns a page
/// whose content cannot be produced again into [`Backing::SwapBacked`]; the
/// other variants survive eviction unchanged.
#[derive(Clone, Debug)]
pub enum Backing {
    /// Fill the page with zero bytes.
    Zero,
    /// Read `read_length` bytes of `handle` at `offset`, and fill the rest of
    /// the page with zero.
    FileBacked {
        /// The file to read from.
        handle: RegularFile,
        /// Position in the file of the first byte of the page.
        offset: usize,
        /// Number of bytes of the page that come from the file.
        read_length: usize,
    },
    /// Read the whole page from a swap slot.
    ///
    /// Once the page is read back into memory the slot is released, so a
    /// resident page holding this descriptor refers to no slot; its content
    /// exists only in its frame.
    SwapBacked {
        /// The slot holding the content.
        slot: SlotId,
    },
}

impl Backing {
    /// Returns `true` if the content of a clean page can be produced again
    /// from this descriptor, so that eviction can drop it without writing it
    /// to swap.
    pub fn is_rederivable(&self) -> bool {
        !matches!(self, Backing::SwapBacked { .. })
    }

    /// Fills `page` from a zero or file descriptor.
    ///
    /// Swap-backed pages are read by the swap store instead; passing one is
    /// an [`KernelError::InvalidArgument`].
    pub fn populate(&self, page: &mut Page) -> Result<(), KernelError> {
        match self {
            Backing::Zero => {
                page.zero();
                Ok(())
            }
            Backing::FileBacked {
                handle,
                offset,
                read_length,
            } => {
                if *read_length > PAGE_SIZE {
                    return Err(KernelError::InvalidArgument);
                }
                let (head, tail) = page.inner_mut().split_at_mut(*read_length);
                handle.read_exact(*offset, head)?;
                tail.fill(0);
                Ok(())
            }
            Backing::SwapBacked { .. } => Err(KernelError::InvalidArgument),
        }
    }
}
