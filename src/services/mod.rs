pub mod callback;
pub mod task;

pub use callback::CallbackDispatcher;
pub use task::AbilityTaskService;
