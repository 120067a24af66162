//! Binding table and router.

pub mod binding;
pub mod bindings;
pub mod context;
pub mod filter;

pub use binding::{Bindable, Binding};
pub use bindings::Bindings;
pub use context::RoutingContext;
pub use filter::Filter;
