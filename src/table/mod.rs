mod key;
mod slot;
mod table_of_tables;

pub use key::TableKey;
pub use slot::{TableSlot, TableValue};
pub use table_of_tables::TableOfTables;
