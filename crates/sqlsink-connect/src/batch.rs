//! Batch aggregator
//!
//! Folds many records into one multi-row statement of the shape
//! `<prefix> <tuple1> <tuple2> ... <tupleN>`. Tuples keep arrival order and
//! are separated by exactly one space; there is no trailing separator.

use crate::render::{render_into, MissingFieldPolicy, Record};
use crate::template::Template;

pub use crate::template::BATCH_COMMAND_PREFIX;

/// Separator written before every rendered tuple
pub const TUPLE_SEPARATOR: u8 = b' ';

/// Aggregate with the default (`NULL`) missing-field policy
pub fn aggregate<'a, I>(template: &Template, records: I, prefix: &str) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Record>,
{
    aggregate_with(template, records, prefix, MissingFieldPolicy::default())
}

/// Aggregate with an explicit missing-field policy
pub fn aggregate_with<'a, I>(
    template: &Template,
    records: I,
    prefix: &str,
    policy: MissingFieldPolicy,
) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut out = prefix.as_bytes().to_vec();
    for record in records {
        out.push(TUPLE_SEPARATOR);
        render_into(template, record, policy, &mut out);
    }
    out
}
