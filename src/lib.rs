//! Conductor: phased task distribution over a pool of capability-tagged workers.
//!
//! A plan is a set of tasks with dependencies. The [`dag`] module layers it
//! into phases; each phase's tasks are routed to workers by the [`router`],
//! bounded by the [`registry`]'s slot accounting, retried per [`retry`] policy
//! and executed through a [`worker::TaskExecutor`].

pub mod config;
pub mod dag;
pub mod dispatch;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod report;
pub mod retry;
pub mod router;
pub mod task;
pub mod worker;
