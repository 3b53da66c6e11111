//! Get command implementation.

use segdb_core::RecordStore;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Runs the get command.
pub fn run(path: &Path, index: usize, hex: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Reading index {} from {:?}", index, path);
    let store = RecordStore::open_existing(path)?;
    if !store.has_index(index) {
        let length = store.length();
        return Err(format!("index {index} is outside the store (length {length})").into());
    }

    let Some(data) = store.get(index) else {
        store.close()?;
        return Err(format!("index {index} holds no record").into());
    };

    let mut stdout = std::io::stdout().lock();
    if hex {
        writeln!(stdout, "{}", to_hex(&data))?;
    } else {
        stdout.write_all(&data)?;
        if !data.ends_with(b"\n") {
            writeln!(stdout)?;
        }
    }

    store.close()?;
    Ok(())
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|byte| format!("{byte:02x}")).collect()
}
