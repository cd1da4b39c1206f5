//! The store: operation engine, sessions, contexts and pending I/O.

mod contexts;
mod kv;
mod pending;
mod session;

pub use contexts::{
    AddContext, DeleteContext, IncrementContext, ReadContext, RmwContext, SimpleDeleteContext,
    SimpleReadContext, SimpleUpsertContext, UpsertContext,
};
pub use kv::TideKv;
pub use session::Session;
