use tabled::{settings::Style, Table, Tabled};
use crate::paths::InventoryEntry;
use crate::ui::human_bytes;

#[derive(Tabled)]
pub struct InventoryRow {
    #[tabled(rename = "Tenant")]
    pub tenant: String,
    #[tabled(rename = "Database")]
    pub database: String,
    #[tabled(rename = "Size")]
    pub size: String,
    #[tabled(rename = "WAL")]
    pub wal: String,
    #[tabled(rename = "Backups")]
    pub backups: usize,
}

impl From<&InventoryEntry> for InventoryRow {
    fn from(entry: &InventoryEntry) -> Self {
        Self {
            tenant: entry.tenant_dir.clone(),
            database: entry.database_file.clone(),
            size: human_bytes(entry.size_bytes),
            wal: if entry.has_wal { "yes".to_string() } else { "-".to_string() },
            backups: entry.backups,
        }
    }
}

pub fn inventory_table(entries: &[InventoryEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }

    let rows: Vec<InventoryRow> = entries.iter().map(InventoryRow::from).collect();
    Table::new(&rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_table() {
        assert!(inventory_table(&[]).is_empty());

        let entries = vec![InventoryEntry {
            tenant_dir: "alpha".to_string(),
            database_file: "main.sqlite".to_string(),
            size_bytes: 8192,
            has_wal: true,
            has_shm: true,
            backups: 2,
        }];
        let table = inventory_table(&entries);
        assert!(table.contains("alpha"));
        assert!(table.contains("main.sqlite"));
        assert!(table.contains("8.0 KiB"));
    }
}
