pub mod context;
pub mod errors;
pub mod factory;

pub use context::{AppContext, AppStatus};
pub use errors::AppError;
pub use factory::{AppFactory, AppPaths};
