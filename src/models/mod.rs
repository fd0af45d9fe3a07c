pub mod ability;
pub mod invocation;
pub mod registry;
pub mod task;
pub mod wallet;

pub use ability::{Ability, AbilityStatus};
pub use invocation::{
    Billing, CallbackDelivery, CallbackStatus, InvocationLogEntry, InvocationSource,
    InvocationStatus,
};
pub use registry::{ApiKey, ApiKeyStatus, Executor};
pub use task::{AbilityTask, TaskStatus};
pub use wallet::WalletHold;
