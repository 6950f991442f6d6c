//! Postgres backed collaborators of the replication worker.
//!
//! The queue is read through the PgQ functions of the provider database with
//! [`tokio_postgres`], changes are applied to the destination the same way and table
//! states live in a `replica` schema accessed through [`sqlx`].

pub mod connection;
pub mod copy;
pub mod destination;
pub mod error;
pub mod queue;
pub mod store;
