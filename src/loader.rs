use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::RuntimeError;
use crate::memory::MemoryRegion;

fn is_readable_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_file())
}

/// Locate a firmware image.
///
/// A name that already points at a readable file is used as is. Otherwise each directory of `search_path` is tried in
/// order.
pub fn find_file(name: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    let direct = Path::new(name);
    if is_readable_file(direct) {
        return Some(direct.to_path_buf());
    }
    search_path.iter().map(|dir| dir.join(name)).find(|candidate| {
        debug!("loader: trying {}", candidate.display());
        is_readable_file(candidate)
    })
}

/// Copy the whole file into `region` starting at offset 0 and return the number of bytes loaded.
///
/// Images larger than the region are refused; bytes past the end of the image keep their previous content.
pub fn load_image_mr(path: &Path, region: &MemoryRegion) -> Result<usize, RuntimeError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size > region.size() as u64 {
        return Err(RuntimeError::ImageTooLarge { size, capacity: region.size() });
    }

    let mut image = Vec::with_capacity(size as usize);
    file.read_to_end(&mut image)?;
    if image.len() > region.size() {
        return Err(RuntimeError::ImageTooLarge { size: image.len() as u64, capacity: region.size() });
    }
    region.write(0, &image)?;
    info!("loader: loaded 0x{:x} bytes from {} into {}", image.len(), path.display(), region.name());
    Ok(image.len())
}
