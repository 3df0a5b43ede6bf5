//! Correlation of kernel completions back to the requests that produced them. The kernel only
//! ever sees a [Token], which is the index of the request in a [CorrelationTable] plus a sequence
//! number. The table owns the request for its whole lifetime, nothing else holds a pointer to it.

mod table;
mod token;

pub use table::CorrelationTable;
pub use token::Token;
