//! Per table handlers shaping queue events into destination changes.

mod base;
mod column_mapper;
mod default;

pub use base::{HandlerConfig, HandlerFactory, HandlerRegistry, TableHandler};
pub use column_mapper::ColumnMapperHandler;
pub use default::DefaultHandler;
