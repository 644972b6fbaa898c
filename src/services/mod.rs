//! GitHub API service implementations.

mod graphql;
mod issues;
mod repositories;

pub use graphql::GraphQlService;
pub(crate) use graphql::{graphql_rate_limited, reported_rate_limit};
pub use issues::*;
pub use repositories::*;
