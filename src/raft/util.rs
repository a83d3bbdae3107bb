use std::fs;
use std::io;
use std::path::Path;

use rand::Rng;

const NAME_FILE: &str = "name";

/// Random 7 hex digit node name.
pub fn gen_node_name() -> String {
    let mut rng = rand::thread_rng();
    let num: u32 = rng.gen_range(0..0x1000_0000);
    format!("{:07x}", num)
}

/// Reads the node name persisted in `dir`, generating and persisting a new
/// one on first start.
pub fn load_or_create_node_name(dir: impl AsRef<Path>) -> io::Result<String> {
    let dir = dir.as_ref();
    let path = dir.join(NAME_FILE);
    match fs::read_to_string(&path) {
        Ok(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
        Ok(_) => write_name(dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => write_name(dir),
        Err(e) => Err(e),
    }
}

fn write_name(dir: &Path) -> io::Result<String> {
    fs::create_dir_all(dir)?;
    let name = gen_node_name();
    fs::write(dir.join(NAME_FILE), &name)?;
    Ok(name)
}
