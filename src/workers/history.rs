//! `nwshare history`: browse and manage received files.

use anyhow::{Result, anyhow};

use nwshare::core::persistence::{FileStore, export_file};
use nwshare::utils::time::{format_timestamp, now_millis};

use super::args::HistoryAction;

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn run(action: HistoryAction, store: &dyn FileStore) -> Result<()> {
    match action {
        HistoryAction::List => {
            let files = store.list()?;
            if files.is_empty() {
                println!("no stored files");
            }
            let now = now_millis();
            for file in files {
                println!(
                    "{}  {:<32} {:>10}  from {} ({})  {}{}",
                    file.id,
                    file.file_name,
                    human_size(file.file_size),
                    file.sender_name,
                    file.sender_id,
                    format_timestamp(file.timestamp),
                    if file.is_expired(now) { "  [expired]" } else { "" }
                );
            }
        }
        HistoryAction::Delete { id } => {
            if store.delete(&id)? {
                println!("deleted {id}");
            } else {
                return Err(anyhow!("no stored file {id}"));
            }
        }
        HistoryAction::Prune => {
            let removed = store.prune_expired(now_millis())?;
            println!("pruned {removed} expired file(s)");
        }
        HistoryAction::Export { id, dest } => {
            let (file, data) = store
                .load(&id)?
                .ok_or_else(|| anyhow!("no stored file {id}"))?;
            let path = export_file(&dest, &file, &data)?;
            println!("exported to {}", path.display());
        }
        HistoryAction::Clear => {
            let removed = store.clear()?;
            println!("removed {removed} file(s)");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nwshare::core::persistence::{MemoryStore, StoredFile};
    use uuid::Uuid;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(200_000), "195.3 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn export_and_delete_through_actions() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let file = StoredFile::new(id, "a.txt", 2, "text/plain", "Alice", "ALICE1", now_millis());
        store.save(&file, b"hi").unwrap();

        let dest = tempfile::tempdir().unwrap();
        run(
            HistoryAction::Export {
                id,
                dest: dest.path().to_path_buf(),
            },
            &store,
        )
        .unwrap();
        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"hi");

        run(HistoryAction::Delete { id }, &store).unwrap();
        assert!(run(HistoryAction::Delete { id }, &store).is_err());
        run(HistoryAction::List, &store).unwrap();
    }
}
