/*!
Bootstrapping of the Linux layer.

[`start_block`] finds the root of the kernel address space, [`anchor`] finds `init_task` and
the offset table it validates with. [`budget`] bounds every walk over guest structures.
*/

pub mod anchor;
pub mod budget;
pub mod start_block;

pub use anchor::{find_anchor, validate_task, Anchor, AnchorHint, Rejection, ValidTask};
pub use budget::{BudgetTracker, WalkBudget, WalkBudgets, WalkStatus};
pub use start_block::{KernelRoot, KernelRootScanner, RootSource, ScanCandidate};
