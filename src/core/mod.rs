// Module declarations
pub mod error;
pub mod stream;
pub mod record;
pub mod string_table;
pub mod column;
pub mod table;
pub mod summary_info;

// Re-exports for convenience
pub use error::{MsiError, Result};
pub use stream::Stream;
pub use record::{Field, Record, NULL_INT};
pub use string_table::{Persistence, StringId, StringTable};
pub use column::ColumnInfo;
pub use table::Table;
pub use summary_info::{PropertyValue, SummaryInfo};
