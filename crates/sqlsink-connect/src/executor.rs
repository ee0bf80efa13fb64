//! Query executor
//!
//! Dispatches one rendered statement (single record or aggregated batch)
//! through the pool's pick-one-and-run facade and classifies failures once:
//! an empty pool is recoverable, everything else is not.

use serde::Serialize;
use sqlsink_rdbc::connection::ExecutionOptions;
use sqlsink_rdbc::pool::{pick_one_and_run, ConnectionPool, PoolError, Statement};
use tracing::{debug, error, warn};

use crate::batch::aggregate_with;
use crate::error::ExecError;
use crate::render::{MissingFieldPolicy, Record};
use crate::template::Template;

/// Driver result of a successful execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    /// Rows reported affected by the driver
    pub affected_rows: u64,
}

/// Work handed to [`execute`]
#[derive(Debug)]
pub enum Job<'a> {
    /// An already rendered statement
    Single {
        sql: Vec<u8>,
        options: &'a ExecutionOptions,
    },
    /// Records aggregated into one statement before dispatch
    Batch {
        template: &'a Template,
        prefix: &'a str,
        records: Vec<&'a Record>,
        policy: MissingFieldPolicy,
        options: &'a ExecutionOptions,
    },
}

/// Run `job` on exactly one pooled connection
pub async fn execute(pool: &dyn ConnectionPool, job: Job<'_>) -> Result<QueryResult, ExecError> {
    let (sql, options, records) = match job {
        Job::Single { sql, options } => (sql, options, 1),
        Job::Batch {
            template,
            prefix,
            records,
            policy,
            options,
        } => {
            if records.is_empty() {
                return Err(ExecError::invalid_request("batch contains no records"));
            }
            let sql = aggregate_with(template, records.iter().copied(), prefix, policy);
            (sql, options, records.len())
        }
    };

    let sql = String::from_utf8(sql)
        .map_err(|_| ExecError::invalid_request("rendered statement is not valid UTF-8"))?;

    debug!(
        records,
        bytes = sql.len(),
        database = options.database.as_deref().unwrap_or(""),
        "Dispatching statement"
    );

    match pick_one_and_run(pool, &Statement::with_options(&sql, options)).await {
        Ok(affected_rows) => Ok(QueryResult { affected_rows }),
        Err(err @ PoolError::Empty(_)) => {
            warn!(error = %err, records, "No pooled connection available, request can be retried");
            Err(err.into())
        }
        Err(PoolError::Driver(e)) => {
            error!(
                error = %e,
                category = %e.category(),
                records,
                "Statement failed"
            );
            Err(PoolError::Driver(e).into())
        }
    }
}
