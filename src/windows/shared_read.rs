use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Open `path` read-only without blocking writers that hold it open.
///
/// On Windows the handle allows concurrent read, write and delete so a log
/// being appended or rotated by its owner is never locked by the agent.
#[cfg(target_os = "windows")]
pub fn open_shared_read(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    use winapi::um::winnt::{FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE};

    OpenOptions::new()
        .read(true)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE)
        .open(path)
}

/// Open `path` read-only. Unix opens never take exclusive locks.
#[cfg(not(target_os = "windows"))]
pub fn open_shared_read(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::NamedTempFile;

    #[test]
    fn test_reads_while_writer_holds_file() {
        let mut writer = NamedTempFile::new().unwrap();
        writer.write_all(b"first").unwrap();
        writer.flush().unwrap();

        let mut content = String::new();
        open_shared_read(writer.path()).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "first");

        writer.write_all(b" second").unwrap();
        writer.flush().unwrap();
        content.clear();
        open_shared_read(writer.path()).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "first second");
    }
}
