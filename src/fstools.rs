use std::fs;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    Missing,
    File,
    Directory,
    Symlink,
    Other,
}

pub fn classify_input(path: &Path) -> InputKind {
    // symlink_metadata so links are reported as links, not their targets
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            let file_type = metadata.file_type();
            if file_type.is_symlink() {
                InputKind::Symlink
            } else if file_type.is_file() {
                InputKind::File
            } else if file_type.is_dir() {
                InputKind::Directory
            } else {
                InputKind::Other
            }
        }
        Err(_) => InputKind::Missing,
    }
}
