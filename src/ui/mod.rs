pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{dim, error, header, human_bytes, info, success, summary_row, warn};
pub use table::{InventoryRow, inventory_table};
pub use theme::{theme, Theme};
